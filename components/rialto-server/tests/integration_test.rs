//! Integration tests for the `rialto-server` facade: the end-to-end
//! scenarios from the component design's testable-properties list,
//! exercised against the crate APIs rather than a live IPC transport.

use rialto_media_session::{ClientNotifier, HaveDataStatus, ServerConfiguration, ServerState};
use rialto_server::{RialtoServer, RialtoServerConfig, RialtoServerImpl};
use rialto_shared_types::{Caps, ClientEvent, PlaybackState, RequestId, SourceId, SourceType};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<ClientEvent>>,
}

impl ClientNotifier for RecordingNotifier {
    fn notify(&self, event: ClientEvent) {
        self.events.lock().push(event);
    }
}

async fn active_server() -> (RialtoServerImpl, Arc<RecordingNotifier>, Weak<dyn ClientNotifier>) {
    let server = RialtoServerImpl::new(RialtoServerConfig::default());
    server
        .set_configuration(
            ServerConfiguration {
                socket_name: "rialto".into(),
                max_sessions: 4,
                max_web_audio: 2,
                socket_fd: None,
            },
            "info",
        )
        .await
        .expect("setConfiguration should succeed");
    server.set_state(ServerState::Inactive).await.expect("INACTIVE transition should succeed");
    server.set_state(ServerState::Active).await.expect("ACTIVE transition should succeed");

    let notifier = Arc::new(RecordingNotifier::default());
    let client: Weak<dyn ClientNotifier> = Arc::downgrade(&notifier) as _;
    (server, notifier, client)
}

/// *Audio-only paused preroll* (testable properties §8, scenario 1): create
/// a session, attach an audio source, finalize sources, and pause.
#[tokio::test]
async fn audio_only_paused_preroll_reaches_paused_and_buffered() {
    let (server, notifier, client) = active_server().await;
    let session_id = server.create_session(client).await.expect("createSession should succeed");
    let session = server.session(session_id).expect("session should be registered");

    session.load().expect("load should succeed");
    let caps = Caps {
        mime_type: "audio/mpeg".into(),
        sample_rate: Some(48_000),
        channels: Some(2),
        ..Default::default()
    };
    let source_id = session.attach_source(SourceType::Audio, caps, false).expect("attachSource should succeed");
    session.all_sources_attached().expect("allSourcesAttached should succeed");
    session.pause().expect("pause should succeed");

    let paused_event_seen = notifier
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, ClientEvent::PlaybackStateChange { state: PlaybackState::Paused, .. }));
    assert!(paused_event_seen, "expected a PlaybackStateChangeEvent(PAUSED)");

    // haveData with a stale requestId must fail without disturbing state.
    let err = session.have_data(source_id, HaveDataStatus::Ok, 1, RequestId::from_raw(9999));
    assert!(err.is_err(), "a haveData with an unmatched requestId must be rejected");
}

/// **Session capacity** (testable properties §8): once `maxPlaybacks` is
/// reached, `createSession` fails until a `destroySession` succeeds.
#[tokio::test]
async fn session_capacity_is_enforced_and_recovers_after_destroy() {
    let server = RialtoServerImpl::new(RialtoServerConfig { max_sessions: 1, max_web_audio: 1 });
    server
        .set_configuration(
            ServerConfiguration {
                socket_name: "rialto".into(),
                max_sessions: 1,
                max_web_audio: 1,
                socket_fd: None,
            },
            "info",
        )
        .await
        .unwrap();
    server.set_state(ServerState::Inactive).await.unwrap();
    server.set_state(ServerState::Active).await.unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let client: Weak<dyn ClientNotifier> = Arc::downgrade(&notifier) as _;

    let first = server.create_session(client.clone()).await.expect("first createSession should succeed");
    assert!(server.create_session(client.clone()).await.is_err(), "maxPlaybacks should now be exhausted");

    server.destroy_session(first).await.expect("destroySession should succeed");
    assert!(server.create_session(client).await.is_ok(), "capacity should recover after destroySession");
}

/// Unknown source ids are rejected with an `UnknownId`-style error, never
/// a panic.
#[tokio::test]
async fn remove_source_rejects_an_unknown_source_id() {
    let (server, _notifier, client) = active_server().await;
    let session_id = server.create_session(client).await.unwrap();
    let session = server.session(session_id).unwrap();
    assert!(session.remove_source(SourceId::from_raw(999)).is_err());
}
