//! `Control`: the client registry. Backs both `ApplicationStateChangeEvent`
//! fan-out (§4.1) and the `PingEvent`/`AckEvent` healthcheck exchange,
//! mirroring `IControl*.h`'s single registration surface for both.

use parking_lot::Mutex;
use rialto_heartbeat::{HeartbeatHandler, HeartbeatProcedure};
use rialto_media_session::{ApplicationStateBroadcaster, ClientNotifier, MediaPipelineSession, WebAudioSession};
use rialto_shared_types::{ApplicationState, ClientEvent, ControlHandle, IdGenerator, PingId, RialtoResult};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

/// Registers the client-notification endpoints a server-wide broadcast or
/// healthcheck round needs to reach.
pub struct Control {
    clients: Mutex<HashMap<ControlHandle, Weak<dyn ClientNotifier>>>,
    handle_ids: IdGenerator,
    /// The Control-surface's own share of an in-flight ping: completed
    /// when the matching client calls back through `ack`.
    pending_acks: Mutex<HashMap<PingId, HeartbeatHandler>>,
}

impl Control {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            handle_ids: IdGenerator::new(),
            pending_acks: Mutex::new(HashMap::new()),
        }
    }

    /// `registerClient(client) -> ControlHandle`.
    pub fn register_client(&self, client: Weak<dyn ClientNotifier>) -> ControlHandle {
        let handle: ControlHandle = self.handle_ids.next();
        self.clients.lock().insert(handle, client);
        handle
    }

    /// `unregisterClient(handle)`: subsequent broadcasts silently skip it.
    pub fn unregister_client(&self, handle: ControlHandle) {
        self.clients.lock().remove(&handle);
    }

    /// `getSharedMemory() -> {fd, size}`, delegated from the Control
    /// surface to the registry that actually owns the buffer.
    pub fn get_shared_memory(&self, playback: &rialto_media_session::PlaybackService) -> RialtoResult<(RawFd, usize)> {
        playback.shared_memory()
    }

    /// Fans `ping_id` out across both engines: one `HeartbeatHandler` per
    /// live media session and per live web-audio session (passed to that
    /// session's own `ping`), plus one handler representing the round trip
    /// to every currently-registered client, completed by a later `ack`.
    pub fn ping(
        control: &Arc<Self>,
        ping_id: PingId,
        sessions: &[Arc<MediaPipelineSession>],
        web_audio_sessions: &[Arc<WebAudioSession>],
    ) {
        let subsystem_count = sessions.len() + web_audio_sessions.len() + 1;
        let procedure = HeartbeatProcedure::new(subsystem_count);
        let control_for_ack = control.clone();
        let mut handlers = procedure.create_handlers(ping_id, move |id, success| {
            control_for_ack.broadcast_ack(id, success);
        });
        let client_share = handlers.pop().expect("subsystem_count is sessions.len() + web_audio_sessions.len() + 1, always >= 1");
        for session in sessions {
            let handler = handlers.pop().expect("one handler reserved per session");
            session.ping(handler);
        }
        for session in web_audio_sessions {
            let handler = handlers.pop().expect("one handler reserved per web-audio session");
            session.ping(handler);
        }
        control.pending_acks.lock().insert(ping_id, client_share);
        control.broadcast_ping(ping_id);
    }

    /// `ack(handle, pingId)`: the client's reply to a `PingEvent`,
    /// completing the Control-surface share of that ping's handlers.
    pub fn ack(&self, _handle: ControlHandle, ping_id: PingId) {
        self.pending_acks.lock().remove(&ping_id);
    }

    fn broadcast_ping(&self, id: PingId) {
        for (&handle, client) in self.clients.lock().iter() {
            if let Some(client) = client.upgrade() {
                client.notify(ClientEvent::Ping { control_handle: handle, id });
            }
        }
    }

    fn broadcast_ack(&self, id: PingId, success: bool) {
        for client in self.clients.lock().values() {
            if let Some(client) = client.upgrade() {
                client.notify(ClientEvent::Ack { id, success });
            }
        }
    }
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationStateBroadcaster for Control {
    fn broadcast(&self, state: ApplicationState) {
        for client in self.clients.lock().values() {
            if let Some(client) = client.upgrade() {
                client.notify(ClientEvent::ApplicationStateChange { state });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        events: PMutex<Vec<ClientEvent>>,
    }

    impl ClientNotifier for RecordingNotifier {
        fn notify(&self, event: ClientEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn unregistered_client_is_skipped_by_broadcast() {
        let control = Control::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let handle = control.register_client(Arc::downgrade(&notifier) as _);
        control.unregister_client(handle);
        control.broadcast(ApplicationState::Running);
        assert!(notifier.events.lock().is_empty());
    }

    #[test]
    fn registered_client_receives_application_state_broadcast() {
        let control = Control::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let _handle = control.register_client(Arc::downgrade(&notifier) as _);
        control.broadcast(ApplicationState::Running);
        assert_eq!(notifier.events.lock().len(), 1);
    }

    #[test]
    fn ping_with_no_sessions_acks_once_every_client_callback_arrives() {
        let control = Arc::new(Control::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let _handle = control.register_client(Arc::downgrade(&notifier) as _);

        Control::ping(&control, PingId::from_raw(1), &[], &[]);
        assert!(notifier
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, ClientEvent::Ping { id, .. } if *id == PingId::from_raw(1))));

        control.ack(ControlHandle::from_raw(0), PingId::from_raw(1));
        assert!(notifier
            .events
            .lock()
            .iter()
            .any(|e| matches!(e, ClientEvent::Ack { id, success } if *id == PingId::from_raw(1) && *success)));
    }
}
