//! Owns the session and web-audio registries; refuses every mutation
//! while the server is not `ACTIVE`.

use crate::client::ClientNotifier;
use crate::session::MediaPipelineSession;
use crate::web_audio_session::WebAudioSession;
use parking_lot::Mutex;
use rialto_shared_memory::{PlaybackKind, SharedMemoryBuffer};
use rialto_shared_types::{Caps, IdGenerator, RialtoError, RialtoResult, SessionId, WebAudioHandle};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

/// Capacity limits, supplied once via `SessionServerManager::set_configuration`.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackServiceConfig {
    /// Maximum concurrent `MediaPipelineSession`s (`maxPlaybacks`).
    pub max_playbacks: usize,
    /// Maximum concurrent `WebAudioSession`s (`maxWebAudio`).
    pub max_web_audio: usize,
}

enum Activation {
    Inactive,
    Active { shm: Arc<SharedMemoryBuffer> },
}

/// Registry of live sessions and web-audio sessions, gated on server
/// activity. All mutation here is synchronous on the caller's RPC thread —
/// each session is responsible for marshalling onto its own MainThread.
pub struct PlaybackService {
    config: PlaybackServiceConfig,
    activation: Mutex<Activation>,
    sessions: Mutex<HashMap<SessionId, Arc<MediaPipelineSession>>>,
    web_audios: Mutex<HashMap<WebAudioHandle, Arc<WebAudioSession>>>,
    session_ids: IdGenerator,
    web_audio_ids: IdGenerator,
}

impl PlaybackService {
    /// Creates a service with no shared-memory buffer; `activate` must be
    /// called (by `SessionServerManager`, on `INACTIVE → ACTIVE`) before
    /// any session can be created.
    pub fn new(config: PlaybackServiceConfig) -> Self {
        Self {
            config,
            activation: Mutex::new(Activation::Inactive),
            sessions: Mutex::new(HashMap::new()),
            web_audios: Mutex::new(HashMap::new()),
            session_ids: IdGenerator::new(),
            web_audio_ids: IdGenerator::new(),
        }
    }

    /// Installs the shared-memory buffer for a newly-`ACTIVE` server.
    pub(crate) fn activate(&self, shm: Arc<SharedMemoryBuffer>) {
        *self.activation.lock() = Activation::Active { shm };
    }

    /// Clears both registries and releases the shared-memory buffer, for
    /// `ACTIVE → INACTIVE` (or any transition away from `ACTIVE`).
    pub(crate) fn deactivate(&self) {
        self.sessions.lock().clear();
        self.web_audios.lock().clear();
        *self.activation.lock() = Activation::Inactive;
    }

    /// True while the server is `ACTIVE`.
    pub fn is_active(&self) -> bool {
        matches!(&*self.activation.lock(), Activation::Active { .. })
    }

    /// The shared-memory fd and total size, for clients to map.
    pub fn shared_memory(&self) -> RialtoResult<(RawFd, usize)> {
        match &*self.activation.lock() {
            Activation::Active { shm } => Ok((shm.fd(), shm.size())),
            Activation::Inactive => Err(RialtoError::InvalidState("server is not ACTIVE".into())),
        }
    }

    fn shm(&self) -> RialtoResult<Arc<SharedMemoryBuffer>> {
        match &*self.activation.lock() {
            Activation::Active { shm } => Ok(shm.clone()),
            Activation::Inactive => Err(RialtoError::InvalidState("server is not ACTIVE".into())),
        }
    }

    /// Creates a new `MediaPipelineSession`, refusing if the server is not
    /// `ACTIVE` or `maxPlaybacks` would be exceeded.
    pub fn create_session(&self, client: Weak<dyn ClientNotifier>) -> RialtoResult<SessionId> {
        let shm = self.shm()?;
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.config.max_playbacks {
            return Err(RialtoError::Capacity(format!(
                "maxPlaybacks ({}) already reached",
                self.config.max_playbacks
            )));
        }
        let id: SessionId = self.session_ids.next();
        shm.map_partition(PlaybackKind::Playback, id.as_raw())
            .map_err(|_| RialtoError::ShmExhausted)?;
        let session = match MediaPipelineSession::new(id, client, shm.clone()) {
            Ok(session) => session,
            Err(e) => {
                shm.unmap_partition(PlaybackKind::Playback, id.as_raw());
                return Err(e);
            }
        };
        sessions.insert(id, Arc::new(session));
        tracing::info!(session = id.as_raw(), "session created");
        Ok(id)
    }

    /// Looks up a live session by id.
    pub fn session(&self, id: SessionId) -> RialtoResult<Arc<MediaPipelineSession>> {
        self.sessions.lock().get(&id).cloned().ok_or(RialtoError::UnknownSession(id))
    }

    /// Every live session, for fan-out operations such as a healthcheck
    /// `Ping` round.
    pub fn sessions(&self) -> Vec<Arc<MediaPipelineSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Destroys a session, releasing its shared-memory partition.
    pub fn destroy_session(&self, id: SessionId) -> RialtoResult<()> {
        self.sessions.lock().remove(&id).ok_or(RialtoError::UnknownSession(id))?;
        if let Ok(shm) = self.shm() {
            shm.unmap_partition(PlaybackKind::Playback, id.as_raw());
        }
        Ok(())
    }

    /// Creates a new `WebAudioSession`, refusing if the server is not
    /// `ACTIVE` or `maxWebAudio` would be exceeded.
    pub fn create_web_audio_session(&self, caps: Caps, client: Weak<dyn ClientNotifier>) -> RialtoResult<WebAudioHandle> {
        let shm = self.shm()?;
        let mut web_audios = self.web_audios.lock();
        if web_audios.len() >= self.config.max_web_audio {
            return Err(RialtoError::Capacity(format!(
                "maxWebAudio ({}) already reached",
                self.config.max_web_audio
            )));
        }
        let handle: WebAudioHandle = self.web_audio_ids.next();
        shm.map_partition(PlaybackKind::WebAudio, handle.as_raw())
            .map_err(|_| RialtoError::ShmExhausted)?;
        let session = match WebAudioSession::new(handle, caps, client, shm.clone()) {
            Ok(session) => session,
            Err(e) => {
                shm.unmap_partition(PlaybackKind::WebAudio, handle.as_raw());
                return Err(e);
            }
        };
        web_audios.insert(handle, Arc::new(session));
        tracing::info!(handle = handle.as_raw(), "web audio session created");
        Ok(handle)
    }

    /// Every live web-audio session, for fan-out operations such as a
    /// healthcheck `Ping` round.
    pub fn web_audio_sessions(&self) -> Vec<Arc<WebAudioSession>> {
        self.web_audios.lock().values().cloned().collect()
    }

    /// Looks up a live web-audio session by handle.
    pub fn web_audio_session(&self, handle: WebAudioHandle) -> RialtoResult<Arc<WebAudioSession>> {
        self.web_audios
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(RialtoError::UnknownHandle(handle.as_raw()))
    }

    /// Destroys a web-audio session, releasing its shared-memory partition.
    pub fn destroy_web_audio_session(&self, handle: WebAudioHandle) -> RialtoResult<()> {
        self.web_audios
            .lock()
            .remove(&handle)
            .ok_or(RialtoError::UnknownHandle(handle.as_raw()))?;
        if let Ok(shm) = self.shm() {
            shm.unmap_partition(PlaybackKind::WebAudio, handle.as_raw());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::recording_pair;

    fn service() -> PlaybackService {
        let service = PlaybackService::new(PlaybackServiceConfig {
            max_playbacks: 1,
            max_web_audio: 1,
        });
        service.activate(Arc::new(SharedMemoryBuffer::new(1, 1).unwrap()));
        service
    }

    #[test]
    fn create_session_fails_when_not_active() {
        let service = PlaybackService::new(PlaybackServiceConfig {
            max_playbacks: 1,
            max_web_audio: 1,
        });
        let (_notifier, client) = recording_pair();
        assert!(service.create_session(client).is_err());
    }

    #[test]
    fn create_session_refuses_past_capacity() {
        let service = service();
        let (_notifier, client) = recording_pair();
        service.create_session(client.clone()).unwrap();
        assert!(matches!(service.create_session(client), Err(RialtoError::Capacity(_))));
    }

    #[test]
    fn deactivate_clears_sessions_and_releases_shared_memory() {
        let service = service();
        let (_notifier, client) = recording_pair();
        let id = service.create_session(client).unwrap();
        service.deactivate();
        assert!(service.session(id).is_err());
        assert!(service.shared_memory().is_err());
    }
}
