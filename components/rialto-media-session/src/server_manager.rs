//! Server-wide lifecycle: `{UNINITIALIZED, INACTIVE, ACTIVE, NOT_RUNNING,
//! ERROR}`, driven by the host manager's `setConfiguration`/`setState`.

use crate::playback_service::PlaybackService;
use parking_lot::RwLock;
use rialto_shared_memory::SharedMemoryBuffer;
use rialto_shared_types::{ApplicationState, RialtoError, RialtoResult};
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, Registry};

/// Fans an application-state transition out to every registered client.
///
/// Implemented by `rialto-server`'s `Control`, which owns the actual
/// client registry; `SessionServerManager` only ever announces through
/// this trait, never touches the registry directly.
pub trait ApplicationStateBroadcaster: Send + Sync {
    /// Delivers `state` to every currently-registered client.
    fn broadcast(&self, state: ApplicationState);
}

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// No configuration received yet.
    Uninitialized,
    /// Configured but not yet serving; no shared-memory buffer exists.
    Inactive,
    /// Serving; shared-memory buffer live, sessions may be created.
    Active,
    /// Shutting down; background threads unblocked and stopped.
    NotRunning,
    /// A transition itself failed.
    Error,
}

/// Parameters delivered by `setConfiguration`, stored once and reused by
/// every later `INACTIVE → ACTIVE` transition.
#[derive(Debug, Clone)]
pub struct ServerConfiguration {
    /// Name of the listening socket (the transport itself is out of scope
    /// here; this is carried for parity with the original call shape).
    pub socket_name: String,
    /// Maximum concurrent `MediaPipelineSession`s.
    pub max_sessions: usize,
    /// Maximum concurrent `WebAudioSession`s.
    pub max_web_audio: usize,
    /// Pre-opened socket fd, when the host manager hands one down instead
    /// of naming a path.
    pub socket_fd: Option<i32>,
}

type ReloadHandle = tracing_subscriber::reload::Handle<EnvFilter, Registry>;

/// Drives the server lifecycle and owns the one shared-memory buffer that
/// exists while `ACTIVE`.
pub struct SessionServerManager {
    state: RwLock<ServerState>,
    config: RwLock<Option<ServerConfiguration>>,
    playback_service: Arc<PlaybackService>,
    broadcaster: Arc<dyn ApplicationStateBroadcaster>,
    log_reload: RwLock<Option<ReloadHandle>>,
}

impl SessionServerManager {
    /// Creates a manager in `UNINITIALIZED` state. `playback_service` is
    /// the registry this manager activates/deactivates; `broadcaster` is
    /// the fan-out sink for `ApplicationStateChangeEvent`.
    pub fn new(playback_service: Arc<PlaybackService>, broadcaster: Arc<dyn ApplicationStateBroadcaster>) -> Self {
        Self {
            state: RwLock::new(ServerState::Uninitialized),
            config: RwLock::new(None),
            playback_service,
            broadcaster,
            log_reload: RwLock::new(None),
        }
    }

    /// Installs the `tracing_subscriber` reload handle `setConfiguration`'s
    /// `logLevels` parameter updates. Optional — a manager with no handle
    /// installed simply skips the reload on `setConfiguration`.
    pub fn set_log_reload_handle(&self, handle: ReloadHandle) {
        *self.log_reload.write() = Some(handle);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    /// `setConfiguration(...)`: must arrive before any other control call;
    /// idempotent while still `UNINITIALIZED`.
    pub fn set_configuration(&self, config: ServerConfiguration, log_levels: &str) -> RialtoResult<()> {
        if *self.state.read() != ServerState::Uninitialized {
            return Err(RialtoError::InvalidState(
                "setConfiguration must arrive before any state transition".into(),
            ));
        }
        *self.config.write() = Some(config);
        if let Some(handle) = &*self.log_reload.read() {
            match EnvFilter::try_new(log_levels) {
                Ok(filter) => {
                    if handle.reload(filter).is_err() {
                        tracing::warn!("log filter reload handle is gone");
                    }
                }
                Err(e) => tracing::warn!(error = %e, log_levels, "invalid log-level directive, keeping previous filter"),
            }
        }
        Ok(())
    }

    /// `setState(newState)`.
    pub fn set_state(&self, new_state: ServerState) -> RialtoResult<()> {
        use ServerState::*;
        let mut state = self.state.write();
        match (*state, new_state) {
            (Uninitialized, Inactive) => {
                if self.config.read().is_none() {
                    return Err(RialtoError::InvalidState("setConfiguration has not been called".into()));
                }
                *state = Inactive;
            }
            (Inactive, Active) => {
                let config = self.config.read().clone().ok_or_else(|| {
                    RialtoError::InvalidState("setConfiguration has not been called".into())
                })?;
                match SharedMemoryBuffer::new(config.max_sessions, config.max_web_audio) {
                    Ok(buffer) => {
                        self.playback_service.activate(Arc::new(buffer));
                        *state = Active;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to create shared-memory buffer, staying INACTIVE");
                        drop(state);
                        self.broadcaster.broadcast(ApplicationState::Unknown);
                        return Err(RialtoError::PipelineFailure(e.to_string()));
                    }
                }
            }
            (Active, Inactive) => {
                self.playback_service.deactivate();
                *state = Inactive;
            }
            (_, NotRunning) => {
                self.playback_service.deactivate();
                *state = NotRunning;
            }
            (_, Error) => {
                self.playback_service.deactivate();
                *state = Error;
            }
            (from, to) => {
                return Err(RialtoError::InvalidState(format!("cannot transition from {from:?} to {to:?}")));
            }
        }
        let announced = *state;
        drop(state);
        self.broadcaster.broadcast(to_application_state(announced));
        Ok(())
    }
}

fn to_application_state(state: ServerState) -> ApplicationState {
    match state {
        ServerState::Active => ApplicationState::Running,
        ServerState::Inactive | ServerState::Uninitialized => ApplicationState::Inactive,
        ServerState::NotRunning | ServerState::Error => ApplicationState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback_service::PlaybackServiceConfig;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBroadcaster {
        events: Mutex<Vec<ApplicationState>>,
    }

    impl ApplicationStateBroadcaster for RecordingBroadcaster {
        fn broadcast(&self, state: ApplicationState) {
            self.events.lock().push(state);
        }
    }

    fn manager() -> (Arc<SessionServerManager>, Arc<RecordingBroadcaster>) {
        let playback_service = Arc::new(PlaybackService::new(PlaybackServiceConfig {
            max_playbacks: 2,
            max_web_audio: 1,
        }));
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        (Arc::new(SessionServerManager::new(playback_service, broadcaster.clone())), broadcaster)
    }

    #[test]
    fn set_state_before_configuration_is_rejected() {
        let (manager, _broadcaster) = manager();
        assert!(manager.set_state(ServerState::Inactive).is_err());
    }

    #[test]
    fn full_lifecycle_reaches_active_and_broadcasts_running() {
        let (manager, broadcaster) = manager();
        manager
            .set_configuration(
                ServerConfiguration {
                    socket_name: "rialto".into(),
                    max_sessions: 2,
                    max_web_audio: 1,
                    socket_fd: None,
                },
                "info",
            )
            .unwrap();
        manager.set_state(ServerState::Inactive).unwrap();
        manager.set_state(ServerState::Active).unwrap();
        assert_eq!(manager.state(), ServerState::Active);
        assert_eq!(
            *broadcaster.events.lock(),
            vec![ApplicationState::Inactive, ApplicationState::Running]
        );
    }

    #[test]
    fn configuration_cannot_be_changed_once_inactive() {
        let (manager, _broadcaster) = manager();
        let config = ServerConfiguration {
            socket_name: "rialto".into(),
            max_sessions: 1,
            max_web_audio: 1,
            socket_fd: None,
        };
        manager.set_configuration(config.clone(), "info").unwrap();
        manager.set_state(ServerState::Inactive).unwrap();
        assert!(manager.set_configuration(config, "info").is_err());
    }
}
