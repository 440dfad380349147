//! Socket-level tests: a real `NetClient` against a scripted loopback server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use netsync_client::{ConnectionState, DisconnectReason, NetClient, SnapshotListener};
use netsync_shared::{
    error::NetError,
    math::Vec2,
    protocol::{now_millis, ClientId, EntityState, Message, Payload, Snapshot},
};
use netsync_tests::{init_tracing, wait_until, ScriptedServer};

const LOCAL: ClientId = ClientId(42);

fn snapshot(timestamp: i64, entities: &[(u32, f32, f32)]) -> Message {
    let entities: BTreeMap<_, _> = entities
        .iter()
        .map(|&(id, x, y)| (ClientId(id), EntityState::at(Vec2::new(x, y))))
        .collect();
    Message::snapshot(ClientId::UNASSIGNED, Snapshot { timestamp, entities })
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Joined(ClientId),
    Left(ClientId),
    Identified(ClientId),
    Disconnected(DisconnectReason),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }
}

impl SnapshotListener for Recorder {
    fn on_entity_joined(&mut self, id: ClientId, _position: Vec2) {
        self.0.lock().unwrap().push(Event::Joined(id));
    }

    fn on_entity_left(&mut self, id: ClientId) {
        self.0.lock().unwrap().push(Event::Left(id));
    }

    fn on_identified(&mut self, id: ClientId) {
        self.0.lock().unwrap().push(Event::Identified(id));
    }

    fn on_disconnected(&mut self, reason: DisconnectReason) {
        self.0.lock().unwrap().push(Event::Disconnected(reason));
    }
}

/// Connects, assigns `LOCAL`, and consumes the probe that follows.
async fn identified_session() -> anyhow::Result<(ScriptedServer, NetClient, Recorder)> {
    init_tracing();
    let (mut server, cfg) = ScriptedServer::bind().await?;
    let mut client = NetClient::new(cfg)?;
    let recorder = Recorder::default();
    client.subscribe(Box::new(recorder.clone()));

    client.connect().await?;
    assert_eq!(client.state(), ConnectionState::Connected);
    server.accept().await?;

    server.send_control(&Message::assign_id(LOCAL)).await?;
    wait_until(&mut client, |c| c.is_identified()).await?;
    assert_eq!(client.identity(), Some(LOCAL));

    let probe = server.recv_datagram().await?;
    assert_eq!(probe.payload, Payload::Ping);
    assert_eq!(probe.client_id, LOCAL);

    Ok((server, client, recorder))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identity_then_snapshot_creates_remote_entity() -> anyhow::Result<()> {
    let (server, mut client, recorder) = identified_session().await?;

    client.send_local_state(Vec2::new(3.0, 4.0)).await?;
    server
        .send_datagram(&snapshot(now_millis(), &[(42, 9.0, 9.0), (7, 1.0, 2.0)]))
        .await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(7)).is_some()).await?;

    let world = client.world();
    assert_eq!(
        world.entity(ClientId(7)).map(|e| e.position),
        Some(Vec2::new(1.0, 2.0))
    );
    // The local entity is never driven by snapshots.
    assert!(world.entity(LOCAL).is_none());
    assert!(!world.active().contains(LOCAL));
    assert!(world.history().contains(LOCAL));
    assert_eq!(world.local_position(), Some(Vec2::new(3.0, 4.0)));
    assert!(world.clock_offset_ms().is_some());

    assert_eq!(
        recorder.events(),
        vec![Event::Identified(LOCAL), Event::Joined(ClientId(7))]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_state_reaches_the_server() -> anyhow::Result<()> {
    let (mut server, mut client, _recorder) = identified_session().await?;

    client.send_local_state(Vec2::new(3.0, 4.0)).await?;
    let msg = server.recv_datagram().await?;
    assert_eq!(msg.client_id, LOCAL);
    match msg.payload {
        Payload::ClientState(update) => {
            assert_eq!(update.player_state.position, Vec2::new(3.0, 4.0));
            assert!(update.timestamp > 0);
        }
        other => panic!("expected client state, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entities_leave_when_absent_from_snapshot() -> anyhow::Result<()> {
    let (server, mut client, recorder) = identified_session().await?;
    let t0 = now_millis();

    server
        .send_datagram(&snapshot(t0, &[(7, 1.0, 2.0), (8, 0.0, 0.0)]))
        .await?;
    wait_until(&mut client, |c| c.world().active().len() == 2).await?;

    server.send_datagram(&snapshot(t0 + 50, &[(8, 1.0, 0.0)])).await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(7)).is_none()).await?;

    assert!(client.world().history().get(ClientId(7)).is_none());
    assert_eq!(client.world().history().get(ClientId(8)).map(|h| h.len()), Some(2));
    assert!(recorder.events().contains(&Event::Left(ClientId(7))));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_snapshot_is_dropped() -> anyhow::Result<()> {
    let (server, mut client, recorder) = identified_session().await?;
    let t0 = now_millis();

    server.send_datagram(&snapshot(t0, &[(7, 1.0, 2.0)])).await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(7)).is_some()).await?;

    server
        .send_datagram(&snapshot(t0 - 1_000, &[(7, 0.0, 0.0), (8, 0.0, 0.0)]))
        .await?;
    server
        .send_datagram(&snapshot(t0 + 50, &[(7, 1.5, 2.0), (9, 0.0, 0.0)]))
        .await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(9)).is_some()).await?;

    assert!(!recorder.events().contains(&Event::Joined(ClientId(8))));
    assert_eq!(client.world().history().get(ClientId(7)).map(|h| h.len()), Some(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pong_produces_rtt_sample() -> anyhow::Result<()> {
    let (mut server, mut client, _recorder) = identified_session().await?;

    server.send_datagram(&Message::pong(LOCAL)).await?;
    wait_until(&mut client, |c| c.world().pong_count() == 1).await?;
    assert!(client.world().rtt().last().is_some());

    client.ping().await?;
    assert_eq!(server.recv_datagram().await?.payload, Payload::Ping);
    server.send_datagram(&Message::pong(LOCAL)).await?;
    wait_until(&mut client, |c| c.world().pong_count() == 2).await?;
    assert!(client.world().rtt().smoothed_ms().is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_input_does_not_stop_the_workers() -> anyhow::Result<()> {
    let (mut server, mut client, _recorder) = identified_session().await?;

    server.send_datagram_raw(&b"not json"[..]).await?;
    server
        .send_datagram_raw(&br#"{"clientID":0,"type":"zzz"}"#[..])
        .await?;
    server
        .send_datagram_raw(&br#"{"clientID":0,"type":"sgu","payload":{"timestamp":"soon"}}"#[..])
        .await?;
    server.send_control_raw(br#"{"type":"mystery"}"#).await?;
    server.send_control_raw(b"{{{").await?;
    // Server-bound message on the wrong channel.
    server.send_control(&Message::ping(LOCAL)).await?;

    server.send_datagram(&snapshot(now_millis(), &[(7, 1.0, 2.0)])).await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(7)).is_some()).await?;
    assert_eq!(client.state(), ConnectionState::Identified);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_before_identity_is_ignored() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = ScriptedServer::bind().await?;
    let mut client = NetClient::new(cfg)?;
    client.connect().await?;
    server.accept().await?;

    let addr = client.data_local_addr().expect("data channel bound");
    server.set_client_data_addr(addr);
    server.send_datagram(&snapshot(now_millis(), &[(7, 1.0, 2.0)])).await?;

    for _ in 0..20 {
        client.tick(1.0 / 60.0);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.world().active().is_empty());

    // Not identified yet: local state is recorded but not sent.
    client.send_local_state(Vec2::new(1.0, 1.0)).await?;
    assert_eq!(client.world().local_position(), Some(Vec2::new(1.0, 1.0)));

    server.send_control(&Message::assign_id(LOCAL)).await?;
    wait_until(&mut client, |c| c.is_identified()).await?;
    // The first datagram after identity is the probe, not the skipped state.
    assert_eq!(server.recv_datagram().await?.payload, Payload::Ping);

    server.send_datagram(&snapshot(now_millis(), &[(8, 0.0, 0.0)])).await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(8)).is_some()).await?;
    assert!(client.world().entity(ClientId(7)).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_close_tears_down_session() -> anyhow::Result<()> {
    let (mut server, mut client, recorder) = identified_session().await?;

    server.send_datagram(&snapshot(now_millis(), &[(7, 1.0, 2.0)])).await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(7)).is_some()).await?;

    server.close_control().await?;
    wait_until(&mut client, |c| c.state() == ConnectionState::Disconnected).await?;

    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::RemoteClosed)
    );
    assert_eq!(client.identity(), None);
    assert!(!client.is_connected());
    assert_eq!(client.world().entities().count(), 0);
    assert_eq!(client.world().local_id(), None);

    let events = recorder.events();
    assert!(events.contains(&Event::Left(ClientId(7))));
    assert_eq!(
        events.last(),
        Some(&Event::Disconnected(DisconnectReason::RemoteClosed))
    );

    // The state channel is gone too.
    server.send_datagram(&snapshot(now_millis(), &[(9, 0.0, 0.0)])).await?;
    for _ in 0..20 {
        client.tick(1.0 / 60.0);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.world().entity(ClientId(9)).is_none());
    assert!(matches!(
        client.send_local_state(Vec2::ZERO).await,
        Err(NetError::NotConnected)
    ));

    // A fresh session works after a remote close.
    client.connect().await?;
    server.accept().await?;
    server.send_control(&Message::assign_id(ClientId(43))).await?;
    wait_until(&mut client, |c| c.is_identified()).await?;
    assert_eq!(client.identity(), Some(ClientId(43)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn user_disconnect_resets_state() -> anyhow::Result<()> {
    let (mut server, mut client, recorder) = identified_session().await?;

    server.send_datagram(&snapshot(now_millis(), &[(7, 1.0, 2.0)])).await?;
    wait_until(&mut client, |c| c.world().entity(ClientId(7)).is_some()).await?;

    client.disconnect().await;
    // Both workers have been joined and the reset applied.
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(
        client.last_disconnect_reason(),
        Some(DisconnectReason::Requested)
    );
    assert_eq!(client.identity(), None);
    assert_eq!(client.world().entities().count(), 0);
    assert_eq!(
        recorder.events().last(),
        Some(&Event::Disconnected(DisconnectReason::Requested))
    );
    server.expect_control_closed().await?;

    // A second disconnect is a no-op.
    client.disconnect().await;
    assert_eq!(
        recorder
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Disconnected(_)))
            .count(),
        1
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_twice_is_rejected() -> anyhow::Result<()> {
    let (_server, mut client, _recorder) = identified_session().await?;
    assert!(matches!(
        client.connect().await,
        Err(NetError::AlreadyConnected)
    ));
    assert_eq!(client.state(), ConnectionState::Identified);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_failure_returns_to_disconnected() -> anyhow::Result<()> {
    init_tracing();
    // Grab a free port, then close it.
    let (server, mut cfg) = ScriptedServer::bind().await?;
    drop(server);
    cfg.connect_timeout_ms = 500;

    let mut client = NetClient::new(cfg)?;
    let err = client.connect().await.expect_err("nothing is listening");
    assert!(err.is_transport(), "unexpected error: {err}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.identity(), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_connect_returns_to_disconnected() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut cfg) = ScriptedServer::bind().await?;
    // Name resolution runs off-thread, so the first poll always parks.
    cfg.host = "localhost".to_string();
    let mut client = NetClient::new(cfg)?;

    tokio::select! {
        biased;
        result = client.connect() => anyhow::bail!("connect finished on first poll: {result:?}"),
        _ = async {} => {}
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);

    client.connect().await?;
    assert_eq!(client.state(), ConnectionState::Connected);
    server.accept().await?;
    Ok(())
}
