use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, SignalingError};
use crate::mock::{self, MockConnector, MockRemote};
use crate::protocol::{SignalPayload, frame_type};
use crate::session::{IdentitySession, SessionEvent};

use super::{recv_signal_frame, test_config, within};

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    within(events.recv()).await.expect("session event")
}

async fn open_session(
    identity: &str,
) -> (
    Arc<IdentitySession>,
    mpsc::UnboundedReceiver<SessionEvent>,
    MockRemote,
    mpsc::UnboundedReceiver<MockRemote>,
) {
    let (connector, mut remotes) = MockConnector::new();
    let (session, mut events) = IdentitySession::with_identity(identity, test_config(), connector);
    let remote = within(remotes.recv()).await.expect("client connected");
    remote.send_frame(&mock::open_frame());
    let confirmed = within(session.identity()).await.expect("identity");
    assert_eq!(confirmed, identity);
    match next_event(&mut events).await {
        SessionEvent::Open(id) => assert_eq!(id, identity),
        other => panic!("expected open, got {other:?}"),
    }
    (session, events, remote, remotes)
}

#[tokio::test]
async fn open_resolves_identity_for_every_awaiter() {
    let (connector, mut remotes) = MockConnector::new();
    let (session, _events) = IdentitySession::with_identity("abc", test_config(), connector);

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.identity().await })
    };
    let second = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.identity().await })
    };

    let remote = within(remotes.recv()).await.expect("client connected");
    assert!(
        remote.url.query().unwrap_or_default().contains("id=abc"),
        "control url must carry the identity"
    );
    remote.send_frame(&mock::open_frame());

    assert_eq!(within(first).await.unwrap().unwrap(), "abc");
    assert_eq!(within(second).await.unwrap().unwrap(), "abc");
    assert!(session.is_open());
}

#[tokio::test]
async fn outbound_signals_are_classified_and_enveloped() {
    let (session, _events, mut remote, _remotes) = open_session("abc").await;

    // Unclassifiable payloads are dropped without error.
    session
        .signal("xyz", json!({ "nonsense": true }), "c9")
        .await
        .unwrap();
    // Empty candidate strings never reach the wire.
    session
        .signal("xyz", json!({ "candidate": { "candidate": "" } }), "c9")
        .await
        .unwrap();

    session
        .signal("xyz", json!({ "type": "offer", "sdp": "v=0" }), "c2")
        .await
        .unwrap();
    let frame = recv_signal_frame(&mut remote).await;
    assert_eq!(frame.kind, frame_type::OFFER);
    assert_eq!(frame.dst.as_deref(), Some("xyz"));
    let payload: SignalPayload = serde_json::from_value(frame.payload.unwrap()).unwrap();
    assert_eq!(payload.id, "c2");
    assert_eq!(payload.signal["sdp"], "v=0");

    session
        .signal(
            "xyz",
            json!({ "candidate": { "candidate": "candidate:1 1 UDP 1 10.0.0.1 9 typ host" } }),
            "c2",
        )
        .await
        .unwrap();
    let frame = recv_signal_frame(&mut remote).await;
    assert_eq!(frame.kind, frame_type::CANDIDATE);
}

#[tokio::test]
async fn inbound_signal_frames_are_demultiplexed() {
    let (_session, mut events, remote, _remotes) = open_session("abc").await;

    // Dropped: no source identity.
    let mut no_src = mock::signal_frame(frame_type::OFFER, "ignored", "c0", json!({}));
    no_src.src = None;
    remote.send_frame(&no_src);
    // Dropped: empty candidate string.
    remote.send_frame(&mock::signal_frame(
        frame_type::CANDIDATE,
        "xyz",
        "c1",
        json!({ "candidate": { "candidate": "" } }),
    ));

    remote.send_frame(&mock::signal_frame(
        frame_type::OFFER,
        "xyz",
        "c1",
        json!({ "type": "offer", "sdp": "v=0" }),
    ));
    match next_event(&mut events).await {
        SessionEvent::Signal(signal) => {
            assert_eq!(signal.remote_identity, "xyz");
            assert_eq!(signal.connection_id, "c1");
            assert_eq!(signal.signal["type"], "offer");
        }
        other => panic!("expected signal, got {other:?}"),
    }
}

#[tokio::test]
async fn taken_identity_before_open_destroys_the_session() {
    let (connector, mut remotes) = MockConnector::new();
    let (session, mut events) = IdentitySession::with_identity("abc", test_config(), connector);
    let remote = within(remotes.recv()).await.expect("client connected");

    remote.send_frame(&mock::simple_frame(frame_type::ID_TAKEN));

    let err = within(session.identity()).await.unwrap_err();
    assert_eq!(err, SignalingError::UnavailableId("abc".to_string()));
    match next_event(&mut events).await {
        SessionEvent::Error(err) => assert_eq!(err.kind(), ErrorKind::UnavailableId),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected(Some(id)) if id == "abc"
    ));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Close));
    assert!(session.is_destroyed());
}

#[tokio::test]
async fn invalid_key_before_open_destroys_the_session() {
    let (connector, mut remotes) = MockConnector::new();
    let (session, _events) = IdentitySession::with_identity("abc", test_config(), connector);
    let remote = within(remotes.recv()).await.expect("client connected");

    remote.send_frame(&mock::simple_frame(frame_type::INVALID_KEY));

    let err = within(session.identity()).await.unwrap_err();
    assert_eq!(err, SignalingError::InvalidKey("peerjs".to_string()));
    assert!(session.is_destroyed());
}

#[tokio::test]
async fn server_error_after_open_degrades_to_disconnect() {
    let (session, mut events, remote, _remotes) = open_session("abc").await;

    remote.send_frame(&mock::error_frame("boom"));
    match next_event(&mut events).await {
        SessionEvent::Error(err) => assert_eq!(err, SignalingError::Server("boom".to_string())),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected(Some(id)) if id == "abc"
    ));

    assert!(!session.is_destroyed());
    assert!(session.is_disconnected());
    let err = session
        .signal("xyz", json!({ "type": "offer" }), "c1")
        .await
        .unwrap_err();
    assert_eq!(err, SignalingError::Disconnected);
}

#[tokio::test]
async fn transport_drop_before_open_is_fatal() {
    let (connector, mut remotes) = MockConnector::new();
    let (session, mut events) = IdentitySession::with_identity("abc", test_config(), connector);
    let remote = within(remotes.recv()).await.expect("client connected");

    drop(remote);

    let err = within(session.identity()).await.unwrap_err();
    assert_eq!(err, SignalingError::SocketClosed);
    match next_event(&mut events).await {
        SessionEvent::Error(err) => assert_eq!(err, SignalingError::SocketClosed),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected(Some(_))
    ));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Close));
    assert!(session.is_destroyed());
}

#[tokio::test]
async fn transport_drop_after_open_allows_reconnect() {
    let (session, mut events, remote, mut remotes) = open_session("abc").await;

    drop(remote);
    match next_event(&mut events).await {
        SessionEvent::Error(err) => assert_eq!(err, SignalingError::Network),
        other => panic!("expected network error, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected(Some(id)) if id == "abc"
    ));
    assert!(!session.is_destroyed());

    session.reconnect().await.unwrap();
    let remote = within(remotes.recv()).await.expect("redial");
    assert!(remote.url.query().unwrap_or_default().contains("id=abc"));
    remote.send_frame(&mock::open_frame());
    match next_event(&mut events).await {
        SessionEvent::Open(id) => assert_eq!(id, "abc"),
        other => panic!("expected reopen, got {other:?}"),
    }
    assert!(session.is_open());
}

#[tokio::test]
async fn reconnect_rules_follow_session_state() {
    let (connector, mut remotes) = MockConnector::new();
    let (session, _events) = IdentitySession::with_identity("abc", test_config(), connector);

    // First attempt still in flight: nothing to do.
    session.reconnect().await.unwrap();

    let remote = within(remotes.recv()).await.expect("client connected");
    remote.send_frame(&mock::open_frame());
    within(session.identity()).await.unwrap();
    assert_eq!(
        session.reconnect().await.unwrap_err(),
        SignalingError::NotDisconnected
    );

    session.destroy().await;
    assert_eq!(
        session.reconnect().await.unwrap_err(),
        SignalingError::CannotReconnect
    );
}

#[tokio::test]
async fn destroy_is_terminal_and_idempotent() {
    let (session, mut events, _remote, _remotes) = open_session("abc").await;

    session.destroy().await;
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Disconnected(Some(id)) if id == "abc"
    ));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Close));

    session.destroy().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err(), "second destroy must be silent");

    let err = session
        .signal("xyz", json!({ "type": "offer" }), "c1")
        .await
        .unwrap_err();
    assert_eq!(err, SignalingError::Disconnected);
}

#[tokio::test]
async fn leave_expire_and_unknown_frames_are_surfaced() {
    let (_session, mut events, remote, _remotes) = open_session("abc").await;

    remote.send_frame(&mock::peer_frame(frame_type::LEAVE, "xyz"));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Leave(Some(id)) if id == "xyz"
    ));

    remote.send_frame(&mock::peer_frame(frame_type::EXPIRE, "xyz"));
    match next_event(&mut events).await {
        SessionEvent::Error(err) => {
            assert_eq!(err.kind(), ErrorKind::PeerUnavailable);
            assert_eq!(err.peer_identity(), Some("xyz"));
        }
        other => panic!("expected expire error, got {other:?}"),
    }

    remote.send_frame(&mock::simple_frame("FANCY"));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Unknown(frame) if frame.kind == "FANCY"
    ));
}
