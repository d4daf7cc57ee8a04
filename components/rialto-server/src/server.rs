//! `RialtoServerImpl`: the top-level facade binding `SessionServerManager`,
//! `PlaybackService` and `Control` behind the §6 RPC method surface as
//! thin adapters, in the shape of the teacher's `MediaEngineImpl`/
//! `impl MediaEngine for MediaEngineImpl`.

use crate::capabilities;
use crate::control::Control;
use async_trait::async_trait;
use rialto_media_session::{
    BufferAvailable, ClientNotifier, DeviceInfo, HaveDataStatus, MediaPipelineSession, PlaybackService,
    PlaybackServiceConfig, ServerConfiguration, ServerState, SessionServerManager, WebAudioSession,
};
use rialto_shared_types::{
    Caps, ControlHandle, PingId, RequestId, RialtoResult, SessionId, SourceId, SourceType, WebAudioHandle,
};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

/// Configuration used to construct a [`RialtoServerImpl`]; the
/// `maxSessions`/`maxWebAudio`/socket parameters `setConfiguration`
/// supplies at runtime are carried separately through [`ServerConfiguration`].
#[derive(Debug, Clone)]
pub struct RialtoServerConfig {
    /// Upper bound the underlying `PlaybackService` enforces regardless of
    /// what a later `setConfiguration` call requests.
    pub max_sessions: usize,
    /// Upper bound for concurrent Web Audio sessions.
    pub max_web_audio: usize,
}

impl Default for RialtoServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            max_web_audio: 4,
        }
    }
}

/// The whole session-engine server surface, as thin async adapters over
/// the synchronous engines beneath.
#[async_trait]
pub trait RialtoServer: Send + Sync {
    /// `setConfiguration(maxSessions, maxWebAudio, socketName, logLevels)`.
    async fn set_configuration(&self, config: ServerConfiguration, log_levels: &str) -> RialtoResult<()>;
    /// `setState(newState)`.
    async fn set_state(&self, state: ServerState) -> RialtoResult<()>;
    /// Current server lifecycle state.
    fn state(&self) -> ServerState;

    /// `registerClient(client) -> ControlHandle`.
    fn register_client(&self, client: Weak<dyn ClientNotifier>) -> ControlHandle;
    /// `unregisterClient(handle)`.
    fn unregister_client(&self, handle: ControlHandle);
    /// `ack(handle, pingId)`.
    fn ack(&self, handle: ControlHandle, ping_id: PingId);
    /// Fans a healthcheck `Ping{id}` out to every live session plus every
    /// registered client.
    fn ping(&self, ping_id: PingId);
    /// `getSharedMemory() -> {fd, size}`.
    fn get_shared_memory(&self) -> RialtoResult<(RawFd, usize)>;

    /// `createSession(client) -> sessionId`.
    async fn create_session(&self, client: Weak<dyn ClientNotifier>) -> RialtoResult<SessionId>;
    /// `destroySession(sessionId)`.
    async fn destroy_session(&self, id: SessionId) -> RialtoResult<()>;
    /// Looks up a live session, for callers that need more than one RPC's
    /// worth of access to it in a row.
    fn session(&self, id: SessionId) -> RialtoResult<Arc<MediaPipelineSession>>;

    /// `createWebAudioSession(caps, client) -> handle`.
    async fn create_web_audio_session(&self, caps: Caps, client: Weak<dyn ClientNotifier>) -> RialtoResult<WebAudioHandle>;
    /// `destroyWebAudioSession(handle)`.
    async fn destroy_web_audio_session(&self, handle: WebAudioHandle) -> RialtoResult<()>;
    /// Looks up a live Web Audio session.
    fn web_audio_session(&self, handle: WebAudioHandle) -> RialtoResult<Arc<WebAudioSession>>;

    /// `getSupportedMimeTypes(sourceType)`.
    fn supported_mime_types(&self, source_type: SourceType) -> Vec<String>;
    /// `isMimeTypeSupported(mimeType)`.
    fn is_mime_type_supported(&self, mime_type: &str) -> bool;
}

/// Concrete [`RialtoServer`]: owns the manager, the registry, and the
/// client-facing `Control`.
pub struct RialtoServerImpl {
    manager: Arc<SessionServerManager>,
    playback: Arc<PlaybackService>,
    control: Arc<Control>,
}

impl RialtoServerImpl {
    /// Wires a fresh, `UNINITIALIZED` server.
    pub fn new(config: RialtoServerConfig) -> Self {
        let playback = Arc::new(PlaybackService::new(PlaybackServiceConfig {
            max_playbacks: config.max_sessions,
            max_web_audio: config.max_web_audio,
        }));
        let control = Arc::new(Control::new());
        let manager = Arc::new(SessionServerManager::new(playback.clone(), control.clone()));
        Self {
            manager,
            playback,
            control,
        }
    }
}

#[async_trait]
impl RialtoServer for RialtoServerImpl {
    async fn set_configuration(&self, config: ServerConfiguration, log_levels: &str) -> RialtoResult<()> {
        self.manager.set_configuration(config, log_levels)
    }

    async fn set_state(&self, state: ServerState) -> RialtoResult<()> {
        self.manager.set_state(state)
    }

    fn state(&self) -> ServerState {
        self.manager.state()
    }

    fn register_client(&self, client: Weak<dyn ClientNotifier>) -> ControlHandle {
        self.control.register_client(client)
    }

    fn unregister_client(&self, handle: ControlHandle) {
        self.control.unregister_client(handle)
    }

    fn ack(&self, handle: ControlHandle, ping_id: PingId) {
        self.control.ack(handle, ping_id)
    }

    fn ping(&self, ping_id: PingId) {
        let sessions = self.playback.sessions();
        let web_audio_sessions = self.playback.web_audio_sessions();
        Control::ping(&self.control, ping_id, &sessions, &web_audio_sessions);
    }

    fn get_shared_memory(&self) -> RialtoResult<(RawFd, usize)> {
        self.control.get_shared_memory(&self.playback)
    }

    async fn create_session(&self, client: Weak<dyn ClientNotifier>) -> RialtoResult<SessionId> {
        self.playback.create_session(client)
    }

    async fn destroy_session(&self, id: SessionId) -> RialtoResult<()> {
        self.playback.destroy_session(id)
    }

    fn session(&self, id: SessionId) -> RialtoResult<Arc<MediaPipelineSession>> {
        self.playback.session(id)
    }

    async fn create_web_audio_session(&self, caps: Caps, client: Weak<dyn ClientNotifier>) -> RialtoResult<WebAudioHandle> {
        self.playback.create_web_audio_session(caps, client)
    }

    async fn destroy_web_audio_session(&self, handle: WebAudioHandle) -> RialtoResult<()> {
        self.playback.destroy_web_audio_session(handle)
    }

    fn web_audio_session(&self, handle: WebAudioHandle) -> RialtoResult<Arc<WebAudioSession>> {
        self.playback.web_audio_session(handle)
    }

    fn supported_mime_types(&self, source_type: SourceType) -> Vec<String> {
        capabilities::supported_mime_types(source_type)
    }

    fn is_mime_type_supported(&self, mime_type: &str) -> bool {
        capabilities::is_mime_type_supported(mime_type)
    }
}

/// `haveData(sessionId, sourceId, status, numFrames, requestId)`: a free
/// function rather than a `RialtoServer` method since it has no natural
/// home on the trait beyond "look the session up and forward" — kept
/// alongside the other session-scoped thin adapters below.
pub fn have_data(
    server: &dyn RialtoServer,
    session_id: SessionId,
    source_id: SourceId,
    status: HaveDataStatus,
    num_frames: u32,
    request_id: RequestId,
) -> RialtoResult<()> {
    server.session(session_id)?.have_data(source_id, status, num_frames, request_id)
}

/// `getBufferAvailable(handle)`.
pub fn get_buffer_available(server: &dyn RialtoServer, handle: WebAudioHandle) -> RialtoResult<BufferAvailable> {
    Ok(server.web_audio_session(handle)?.get_buffer_available())
}

/// `writeBuffer(handle, numberOfFrames)`.
pub fn write_buffer(server: &dyn RialtoServer, handle: WebAudioHandle, number_of_frames: u32) -> RialtoResult<u32> {
    server.web_audio_session(handle)?.write_buffer(number_of_frames)
}

/// `setEos(handle)`.
pub fn set_eos(server: &dyn RialtoServer, handle: WebAudioHandle) -> RialtoResult<()> {
    server.web_audio_session(handle)?.set_eos()
}

/// `getBufferDelay(handle)`.
pub fn get_buffer_delay(server: &dyn RialtoServer, handle: WebAudioHandle) -> RialtoResult<u32> {
    Ok(server.web_audio_session(handle)?.get_buffer_delay())
}

/// `getDeviceInfo(handle)`.
pub fn get_device_info(server: &dyn RialtoServer, handle: WebAudioHandle) -> RialtoResult<DeviceInfo> {
    Ok(server.web_audio_session(handle)?.get_device_info())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rialto_shared_types::ClientEvent;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<ClientEvent>>,
    }

    impl ClientNotifier for RecordingNotifier {
        fn notify(&self, event: ClientEvent) {
            self.events.lock().push(event);
        }
    }

    fn configured_server() -> RialtoServerImpl {
        let server = RialtoServerImpl::new(RialtoServerConfig::default());
        server.manager
            .set_configuration(
                ServerConfiguration {
                    socket_name: "rialto".into(),
                    max_sessions: 10,
                    max_web_audio: 4,
                    socket_fd: None,
                },
                "info",
            )
            .unwrap();
        server
    }

    #[tokio::test]
    async fn server_reaches_active_after_configure_and_two_state_transitions() {
        let server = configured_server();
        server.set_state(ServerState::Inactive).await.unwrap();
        server.set_state(ServerState::Active).await.unwrap();
        assert_eq!(server.state(), ServerState::Active);
    }

    #[tokio::test]
    async fn create_session_requires_active_server() {
        let server = configured_server();
        let notifier = Arc::new(RecordingNotifier::default());
        let client = Arc::downgrade(&notifier) as Weak<dyn ClientNotifier>;
        assert!(server.create_session(client.clone()).await.is_err());

        server.set_state(ServerState::Inactive).await.unwrap();
        server.set_state(ServerState::Active).await.unwrap();
        let id = server.create_session(client).await.unwrap();
        assert!(server.session(id).is_ok());
    }

    #[tokio::test]
    async fn register_client_receives_application_state_change_broadcast() {
        let server = configured_server();
        let notifier = Arc::new(RecordingNotifier::default());
        let _handle = server.register_client(Arc::downgrade(&notifier) as _);
        server.set_state(ServerState::Inactive).await.unwrap();
        assert_eq!(notifier.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn ping_with_no_sessions_acks_through_registered_clients() {
        let server = configured_server();
        let notifier = Arc::new(RecordingNotifier::default());
        let _handle = server.register_client(Arc::downgrade(&notifier) as _);

        server.ping(PingId::from_raw(9));
        let control_handle = match notifier.events.lock().iter().find_map(|e| match e {
            ClientEvent::Ping { control_handle, id } if *id == PingId::from_raw(9) => Some(*control_handle),
            _ => None,
        }) {
            Some(handle) => handle,
            None => panic!("expected a Ping event to have been sent"),
        };
        server.ack(control_handle, PingId::from_raw(9));
        assert!(notifier
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, ClientEvent::Ack { id, success } if *id == PingId::from_raw(9) && *success)));
    }

    #[tokio::test]
    async fn ping_fans_out_to_both_media_and_web_audio_sessions() {
        let server = configured_server();
        server.set_state(ServerState::Inactive).await.unwrap();
        server.set_state(ServerState::Active).await.unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        let client = Arc::downgrade(&notifier) as Weak<dyn ClientNotifier>;
        let session_id = server.create_session(client.clone()).await.unwrap();
        let handle = server
            .create_web_audio_session(
                Caps {
                    mime_type: "audio/pcm".into(),
                    sample_rate: Some(48_000),
                    channels: Some(2),
                    ..Default::default()
                },
                client.clone(),
            )
            .await
            .unwrap();
        let control_handle = server.register_client(client);

        server.ping(PingId::from_raw(42));
        // Both session kinds' `ping` fire-and-forget onto their own
        // MainThread; round-trip a synchronous call through each one to
        // guarantee its ping task (and the handler drop it carries) has
        // run before checking for the aggregated ack.
        server.session(session_id).unwrap().get_stats().unwrap();
        server.web_audio_session(handle).unwrap().get_buffer_delay();
        server.ack(control_handle, PingId::from_raw(42));

        let acked = notifier
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, ClientEvent::Ack { id, success } if *id == PingId::from_raw(42) && *success));
        assert!(acked, "ping with a live session of each kind should still ack once every handler is dropped");
    }

    #[tokio::test]
    async fn mime_type_capabilities_are_thin_static_lookups() {
        let server = configured_server();
        assert!(server.is_mime_type_supported("audio/mpeg"));
        assert!(server.supported_mime_types(SourceType::Video).iter().any(|m| m == "video/mp4"));
    }
}
