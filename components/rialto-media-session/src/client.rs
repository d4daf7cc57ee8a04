//! The weakly-held client-notification endpoint.
//!
//! Sessions never own their client: a closed RPC channel must not be kept
//! alive by a session that has outlived it. Every dispatch path upgrades a
//! `Weak<dyn ClientNotifier>` and silently drops the event if the upgrade
//! fails.

use rialto_shared_types::ClientEvent;

/// The notification sink a session (or Control) holds weakly.
///
/// The IPC transport that actually serializes `ClientEvent` onto a wire is
/// out of scope here; implementors typically wrap an outbound RPC stub.
pub trait ClientNotifier: Send + Sync {
    /// Delivers one event. Implementations must not block for long —
    /// this runs on the session's MainThread.
    fn notify(&self, event: ClientEvent);
}

/// Upgrades `client` and delivers `event`, dropping it silently if the
/// endpoint is gone.
pub(crate) fn notify_weak(client: &std::sync::Weak<dyn ClientNotifier>, event: ClientEvent) {
    if let Some(client) = client.upgrade() {
        client.notify(event);
    } else {
        tracing::debug!("client endpoint gone, dropping event");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: Mutex<Vec<ClientEvent>>,
    }

    impl ClientNotifier for RecordingNotifier {
        fn notify(&self, event: ClientEvent) {
            self.events.lock().push(event);
        }
    }

    pub fn recording_pair() -> (Arc<RecordingNotifier>, std::sync::Weak<dyn ClientNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let weak: std::sync::Weak<dyn ClientNotifier> = Arc::downgrade(&notifier) as _;
        (notifier, weak)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rialto_shared_types::{ApplicationState, SessionId};
    use std::sync::Arc;

    #[test]
    fn dropped_client_silently_swallows_events() {
        let notifier = test_support::recording_pair().0;
        let weak = Arc::downgrade(&notifier);
        drop(notifier);
        notify_weak(&(weak as std::sync::Weak<dyn ClientNotifier>), ClientEvent::ApplicationStateChange { state: ApplicationState::Running });
    }

    #[test]
    fn live_client_receives_event() {
        let (notifier, weak) = recording_pair();
        notify_weak(
            &weak,
            ClientEvent::PlaybackStateChange {
                session_id: SessionId::from_raw(1),
                state: rialto_shared_types::PlaybackState::Idle,
            },
        );
        assert_eq!(notifier.events.lock().len(), 1);
    }
}
