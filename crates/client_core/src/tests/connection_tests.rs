use super::*;
use crate::test_support::{
    drain_events, manager, settle, FakeTransport, OpenOutcome, TOKEN,
};
use shared::{
    domain::{ChatId, UserId},
    protocol::PresencePayload,
};

fn states(events: &[ClientEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            ClientEvent::ConnectionStateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn connect_reports_lifecycle_and_connection_id() {
    let transport = FakeTransport::new();
    let (manager, mut rx) = manager(&transport, false);

    manager.connect(TOKEN, Role::Provider).await.expect("connect");

    assert!(manager.is_connected());
    assert_eq!(manager.current_role().await, Some(Role::Provider));
    assert_eq!(
        manager.connection_id().await,
        Some(ConnectionId::from("conn-1"))
    );
    assert_eq!(
        states(&drain_events(&mut rx)),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test]
async fn connect_with_same_identity_is_a_no_op() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);

    manager.connect(TOKEN, Role::EndUser).await.expect("first");
    manager.connect(TOKEN, Role::EndUser).await.expect("second");

    assert_eq!(transport.open_count(), 1);
    assert!(!transport.peer(0).client_closed());
}

#[tokio::test]
async fn role_switch_tears_down_before_reconnecting() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);

    manager.connect(TOKEN, Role::EndUser).await.expect("connect");
    manager
        .join_room(RoomId::chat(&ChatId::from("c1")))
        .await
        .expect("join");

    manager.connect(TOKEN, Role::Provider).await.expect("switch");

    assert_eq!(
        transport.requests(),
        vec![
            (TOKEN.to_string(), Role::EndUser),
            (TOKEN.to_string(), Role::Provider)
        ]
    );
    assert!(transport.peer(0).client_closed());
    assert!(manager.joined_rooms().await.is_empty());
    assert_eq!(manager.current_role().await, Some(Role::Provider));
}

#[tokio::test]
async fn token_change_also_forces_a_new_link() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);

    manager.connect(TOKEN, Role::EndUser).await.expect("connect");
    manager.connect("tok-2", Role::EndUser).await.expect("reconnect");

    assert_eq!(transport.open_count(), 2);
    assert!(transport.peer(0).client_closed());
    let stored = manager.stored_credentials().await.expect("credentials");
    assert_eq!(stored.token, "tok-2");
}

#[tokio::test]
async fn join_room_is_idempotent_and_leave_of_unknown_room_is_silent() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);
    manager.connect(TOKEN, Role::EndUser).await.expect("connect");
    let room = RoomId::chat(&ChatId::from("c1"));

    manager.join_room(room.clone()).await.expect("join");
    manager.join_room(room.clone()).await.expect("join again");
    manager
        .leave_room(RoomId::chat(&ChatId::from("never-joined")))
        .await
        .expect("leave unknown");

    assert_eq!(
        transport.peer(0).drain(),
        vec![ClientFrame::JoinRoom { room: room.clone() }]
    );

    manager.leave_room(room.clone()).await.expect("leave");
    manager.leave_room(room.clone()).await.expect("leave again");
    assert_eq!(
        transport.peer(0).drain(),
        vec![ClientFrame::LeaveRoom { room }]
    );
}

#[tokio::test]
async fn join_room_without_link_fails() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);

    let err = manager
        .join_room(RoomId::chat(&ChatId::from("c1")))
        .await
        .expect_err("not connected");
    assert!(matches!(err, RealtimeError::NotConnected));
    assert!(manager.joined_rooms().await.is_empty());
}

#[tokio::test]
async fn rejected_identity_clears_credentials_and_is_not_retried() {
    let transport = FakeTransport::new();
    transport.script([OpenOutcome::Fail(RealtimeError::Authorization(
        "token expired".into(),
    ))]);
    let (manager, mut rx) = manager(&transport, true);

    let err = manager
        .connect(TOKEN, Role::Provider)
        .await
        .expect_err("rejected");
    assert!(err.is_authorization());
    settle().await;

    assert_eq!(transport.open_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.stored_credentials().await.is_none());
    assert_eq!(manager.reconnect_failures().await, 0);
    assert!(drain_events(&mut rx).iter().any(|event| matches!(
        event,
        ClientEvent::AuthorizationRevoked { reason } if reason.contains("token expired")
    )));
    assert!(!manager.on_foreground().await.expect("foreground"));
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn hung_handshake_times_out() {
    let transport = FakeTransport::new();
    transport.script([OpenOutcome::Hang]);
    let (manager, _rx) = manager(&transport, false);

    let err = manager
        .connect(TOKEN, Role::EndUser)
        .await
        .expect_err("timeout");

    assert!(matches!(err, RealtimeError::Timeout(d) if d == Duration::from_secs(10)));
    assert_eq!(manager.reconnect_failures().await, 1);
}

#[tokio::test(start_paused = true)]
async fn ensure_connected_respects_backoff_and_gives_up() {
    let transport = FakeTransport::new();
    transport.script((0..5).map(|_| OpenOutcome::Fail(RealtimeError::Transport("refused".into()))));
    let (manager, _rx) = manager(&transport, false);

    let err = manager
        .ensure_connected(TOKEN, Role::EndUser)
        .await
        .expect_err("first attempt");
    assert!(matches!(err, RealtimeError::Transport(_)));
    assert_eq!(transport.open_count(), 1);

    assert!(!manager
        .ensure_connected(TOKEN, Role::EndUser)
        .await
        .expect("held"));
    assert_eq!(transport.open_count(), 1);

    tokio::time::advance(Duration::from_millis(500)).await;
    manager
        .ensure_connected(TOKEN, Role::EndUser)
        .await
        .expect_err("second attempt");
    assert_eq!(transport.open_count(), 2);

    tokio::time::advance(Duration::from_millis(999)).await;
    assert!(!manager
        .ensure_connected(TOKEN, Role::EndUser)
        .await
        .expect("held"));
    tokio::time::advance(Duration::from_millis(1)).await;
    manager
        .ensure_connected(TOKEN, Role::EndUser)
        .await
        .expect_err("third attempt");
    assert_eq!(transport.open_count(), 3);

    tokio::time::advance(Duration::from_secs(60)).await;
    let err = manager
        .ensure_connected(TOKEN, Role::EndUser)
        .await
        .expect_err("exhausted");
    assert!(matches!(err, RealtimeError::RetriesExhausted { attempts: 3 }));
    assert_eq!(transport.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn explicit_connect_after_exhaustion_starts_over() {
    let transport = FakeTransport::new();
    transport.script((0..3).map(|_| OpenOutcome::Fail(RealtimeError::Transport("refused".into()))));
    let (manager, _rx) = manager(&transport, false);

    for _ in 0..3 {
        let _ = manager.connect(TOKEN, Role::EndUser).await;
        tokio::time::advance(Duration::from_secs(30)).await;
    }
    assert!(matches!(
        manager.ensure_connected(TOKEN, Role::EndUser).await,
        Err(RealtimeError::RetriesExhausted { .. })
    ));

    manager.connect(TOKEN, Role::EndUser).await.expect("fresh connect");
    assert!(manager.is_connected());
    assert_eq!(manager.reconnect_failures().await, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_link_clears_rooms_and_reconnects() {
    let transport = FakeTransport::new();
    let (manager, mut rx) = manager(&transport, true);
    manager.connect(TOKEN, Role::Provider).await.expect("connect");
    manager
        .join_room(RoomId::chat(&ChatId::from("c1")))
        .await
        .expect("join");
    drain_events(&mut rx);

    transport.peer(0).close();
    settle().await;

    assert_eq!(transport.open_count(), 2);
    assert!(manager.is_connected());
    assert!(manager.joined_rooms().await.is_empty());
    assert_eq!(
        manager.connection_id().await,
        Some(ConnectionId::from("conn-2"))
    );
    assert_eq!(
        states(&drain_events(&mut rx)),
        vec![ConnectionState::Reconnecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_loop_keeps_going_after_garbled_handshake() {
    let transport = FakeTransport::new();
    let (manager, mut rx) = manager(&transport, true);
    manager.connect(TOKEN, Role::Provider).await.expect("connect");
    transport.script([OpenOutcome::Fail(RealtimeError::Data("bad frame".into()))]);
    drain_events(&mut rx);

    transport.peer(0).close();
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(transport.open_count(), 3);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        states(&drain_events(&mut rx)),
        vec![ConnectionState::Reconnecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_loop_gives_up_after_max_attempts() {
    let transport = FakeTransport::new();
    let (manager, mut rx) = manager(&transport, true);
    manager.connect(TOKEN, Role::Provider).await.expect("connect");
    transport.script((0..3).map(|_| OpenOutcome::Fail(RealtimeError::Transport("refused".into()))));
    drain_events(&mut rx);

    transport.peer(0).close();
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;

    assert_eq!(transport.open_count(), 4);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    let events = drain_events(&mut rx);
    assert!(events
        .iter()
        .any(|event| matches!(event, ClientEvent::ConnectionLost { attempts: 3 })));
    assert_eq!(
        states(&events),
        vec![ConnectionState::Reconnecting, ConnectionState::Disconnected]
    );
}

#[tokio::test]
async fn foreground_reconnects_with_stored_credentials() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);
    assert!(!manager.on_foreground().await.expect("no identity"));

    manager.connect(TOKEN, Role::EndUser).await.expect("connect");
    transport.peer(0).close();
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
    assert_eq!(transport.open_count(), 1);

    assert!(manager.on_foreground().await.expect("foreground"));
    assert!(manager.is_connected());
    assert_eq!(transport.open_count(), 2);
}

#[tokio::test]
async fn disconnect_drops_link_and_identity() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, true);
    manager.connect(TOKEN, Role::EndUser).await.expect("connect");
    manager
        .join_room(RoomId::chat(&ChatId::from("c1")))
        .await
        .expect("join");

    manager.disconnect().await;
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.stored_credentials().await.is_none());
    assert!(manager.joined_rooms().await.is_empty());
    assert!(transport.peer(0).client_closed());
    assert_eq!(transport.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_for_connection_times_out_while_disconnected() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);

    assert!(!manager.wait_for_connection(Duration::from_secs(2)).await);

    manager.connect(TOKEN, Role::EndUser).await.expect("connect");
    assert!(manager.wait_for_connection(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn inbound_events_reach_handlers_and_malformed_ones_become_notices() {
    let transport = FakeTransport::new();
    let (manager, mut rx) = manager(&transport, false);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on(EventName::Online, move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().await.push(event);
        }
    });
    manager.connect(TOKEN, Role::EndUser).await.expect("connect");

    let peer = transport.peer(0);
    peer.push_raw(Err(RealtimeError::Data("invalid realtime event".into())));
    peer.push(RealtimeEvent::Online(PresencePayload {
        user_id: UserId::from("mentor-1"),
    }));
    settle().await;

    assert_eq!(seen.lock().await.len(), 1);
    assert!(drain_events(&mut rx)
        .iter()
        .any(|event| matches!(event, ClientEvent::Notice(text) if text.contains("invalid realtime event"))));
    assert!(manager.is_connected());
}

#[tokio::test]
async fn emit_forwards_frames_on_the_live_link() {
    let transport = FakeTransport::new();
    let (manager, _rx) = manager(&transport, false);
    assert!(matches!(
        manager.emit(ClientFrame::Online).await,
        Err(RealtimeError::NotConnected)
    ));

    manager.connect(TOKEN, Role::EndUser).await.expect("connect");
    manager.emit(ClientFrame::Online).await.expect("emit");

    assert_eq!(transport.peer(0).drain(), vec![ClientFrame::Online]);
}
