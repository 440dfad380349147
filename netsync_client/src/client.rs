//! Client implementation.
//!
//! [`NetClient`] is the one context object the motion controller and the
//! presentation layer share. It owns:
//! - The reliable control stream (identity handshake, guaranteed messages)
//! - The unreliable datagram socket (pings, local state, snapshots)
//! - One receive worker per channel
//! - The dispatch queue and the [`RemoteWorld`] it feeds
//!
//! Every method takes `&mut self` or `&self` on the consumer thread. Workers
//! only reach the world through the dispatch queue.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use netsync_shared::{
    config::NetConfig,
    error::NetError,
    math::Vec2,
    net::{ReliableConn, ReliableWriter, UnreliableConn},
    protocol::{now_millis, ClientId, Message},
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    dispatch::DispatchQueue,
    lifecycle::{ChannelTokens, ConnectionState, DisconnectReason, Link},
    observer::{ListenerId, SnapshotListener},
    workers::{self, WorkerContext},
    world::RemoteWorld,
};

/// Channels and workers of one connection.
struct Session {
    writer: ReliableWriter,
    data: Arc<UnreliableConn>,
    ctx: WorkerContext,
    control_task: JoinHandle<()>,
    data_task: JoinHandle<()>,
}

impl Session {
    /// Waits for both workers to finish.
    async fn join(self) {
        for (name, task) in [("control", self.control_task), ("data", self.data_task)] {
            if let Err(e) = task.await {
                warn!(worker = name, error = %e, "Receive worker ended abnormally");
            }
        }
    }
}

/// Returns the link to Disconnected unless the attempt reached Connected.
struct ConnectAttempt(Arc<Link>);

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        // No-op once established.
        self.0.fail_connect();
    }
}

/// Client network layer.
pub struct NetClient {
    config: NetConfig,
    link: Arc<Link>,
    queue: DispatchQueue<RemoteWorld>,
    world: RemoteWorld,
    session: Option<Session>,
}

impl NetClient {
    /// Builds the client. No I/O happens until [`NetClient::connect`].
    pub fn new(config: NetConfig) -> Result<Self, NetError> {
        config.validate()?;
        let queue = DispatchQueue::new();
        let link = Arc::new(Link::new(queue.dispatcher()));
        let world = RemoteWorld::new(&config);
        Ok(Self {
            config,
            link,
            queue,
            world,
            session: None,
        })
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Opens both channels and starts their workers.
    ///
    /// Disconnected -> Connecting -> Connected. On failure the client is back
    /// in Disconnected and the error is returned; nothing is retried.
    pub async fn connect(&mut self) -> Result<(), NetError> {
        self.reap_session().await;
        self.link.begin_connect()?;
        // Covers early return and the future being dropped mid-connect.
        let _attempt = ConnectAttempt(Arc::clone(&self.link));
        info!(
            control = %self.config.control_addr(),
            data = %self.config.data_addr(),
            "Connecting to server"
        );

        let (reliable, data) = match self.open_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                return Err(e);
            }
        };

        let tokens = ChannelTokens::new();
        if !self.link.establish(tokens.clone()) {
            return Err(NetError::NotConnected);
        }

        let (reader, writer) = reliable.into_split();
        let data = Arc::new(data);
        let ctx = WorkerContext {
            link: Arc::clone(&self.link),
            dispatcher: self.queue.dispatcher(),
            data: Arc::clone(&data),
        };
        let control_task = tokio::spawn(workers::run_control(
            reader,
            ctx.clone(),
            tokens.control.clone(),
        ));
        let data_task = tokio::spawn(workers::run_data(ctx.clone(), tokens.data.clone()));

        self.session = Some(Session {
            writer,
            data,
            ctx,
            control_task,
            data_task,
        });
        info!("Connected; waiting for identity");
        Ok(())
    }

    async fn open_channels(&self) -> Result<(ReliableConn, UnreliableConn), NetError> {
        let timeout_ms = self.config.connect_timeout_ms;
        let control_addr = self.config.control_addr();
        let reliable = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            ReliableConn::connect(&control_addr),
        )
        .await
        .map_err(|_| NetError::ConnectTimeout {
            addr: control_addr.clone(),
            timeout_ms,
        })??;

        let data_peer = resolve(&self.config.data_addr()).await?;
        let bind = match data_peer.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let data = UnreliableConn::connect(bind, data_peer).await?;
        debug!(local = ?data.local_addr().ok(), peer = %data_peer, "State channel bound");
        Ok((reliable, data))
    }

    /// User-initiated disconnect. Closes both channels and waits for both
    /// workers before returning.
    pub async fn disconnect(&mut self) {
        self.close(DisconnectReason::Requested).await;
    }

    /// Same as [`NetClient::disconnect`] with reason `Shutdown`.
    pub async fn shutdown(&mut self) {
        self.close(DisconnectReason::Shutdown).await;
    }

    async fn close(&mut self, reason: DisconnectReason) {
        let tore_down = self.link.teardown(reason, None);
        if let Some(mut session) = self.session.take() {
            if tore_down {
                if let Err(e) = session.writer.shutdown().await {
                    debug!(error = %e, "Control channel already closed");
                }
            }
            session.join().await;
        }
        // Apply the queued world reset now rather than on the next tick.
        self.queue.drain(&mut self.world);
    }

    /// Joins the workers of a session the server already ended.
    async fn reap_session(&mut self) {
        if self.link.state() == ConnectionState::Disconnected {
            if let Some(session) = self.session.take() {
                session.join().await;
                self.queue.drain(&mut self.world);
            }
        }
    }

    fn identified_session(&self) -> Result<Option<(&Session, ClientId)>, NetError> {
        let Some(session) = self.session.as_ref() else {
            return Err(NetError::NotConnected);
        };
        match self.link.state() {
            ConnectionState::Identified => match self.link.identity() {
                Some(id) => Ok(Some((session, id))),
                None => Ok(None),
            },
            ConnectionState::Connected => Ok(None),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(NetError::NotConnected)
            }
        }
    }

    /// Reports the local entity's position to the server as one `cpu`
    /// datagram and records it as the authoritative local position.
    ///
    /// Before identity is assigned the report is skipped (there is nothing
    /// for the server to attribute it to) and `Ok` is returned.
    pub async fn send_local_state(&mut self, position: Vec2) -> Result<(), NetError> {
        self.world.set_local_position(position);
        let Some((session, id)) = self.identified_session()? else {
            debug!("Skipping local state before identity assignment");
            return Ok(());
        };
        session
            .data
            .send(&Message::client_state(id, now_millis(), position))
            .await
    }

    /// Sends a liveness probe. Requires an identity.
    pub async fn ping(&self) -> Result<(), NetError> {
        match self.identified_session()? {
            Some((session, id)) => {
                workers::send_probe(&session.ctx, id).await;
                Ok(())
            }
            None => Err(NetError::ProtocolViolation(
                "ping before identity assignment".to_string(),
            )),
        }
    }

    /// Sends a message on the reliable control channel.
    pub async fn send_reliable(&mut self, msg: &Message) -> Result<(), NetError> {
        if !self.is_connected() {
            return Err(NetError::NotConnected);
        }
        let session = self.session.as_mut().ok_or(NetError::NotConnected)?;
        session.writer.send(msg).await
    }

    /// Runs queued worker callbacks, then advances interpolation. Call once
    /// per tick. Returns the number of callbacks run.
    pub fn tick(&mut self, dt: f32) -> usize {
        self.tick_at(now_millis() as f64, dt)
    }

    /// [`NetClient::tick`] with an explicit local clock value.
    pub fn tick_at(&mut self, now_ms: f64, dt: f32) -> usize {
        let ran = self.queue.drain(&mut self.world);
        self.world.interpolate(now_ms, dt);
        ran
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Channels open (identity may still be pending).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.link.state(),
            ConnectionState::Connected | ConnectionState::Identified
        )
    }

    pub fn is_identified(&self) -> bool {
        self.link.state() == ConnectionState::Identified
    }

    pub fn identity(&self) -> Option<ClientId> {
        self.link.identity()
    }

    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.link.last_reason()
    }

    /// Local address of the state channel, while connected.
    pub fn data_local_addr(&self) -> Option<SocketAddr> {
        self.session
            .as_ref()
            .and_then(|s| s.data.local_addr().ok())
    }

    pub fn world(&self) -> &RemoteWorld {
        &self.world
    }

    pub fn subscribe(&mut self, listener: Box<dyn SnapshotListener>) -> ListenerId {
        self.world.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.world.unsubscribe(id)
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        // Cannot join here; cancelling is enough for the workers to exit.
        if self.session.is_some() {
            self.link.teardown(DisconnectReason::Shutdown, None);
        }
        self.queue.close();
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, NetError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| NetError::transport("resolve host", e))?
        .next()
        .ok_or_else(|| {
            NetError::transport(
                "resolve host",
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("no address for {addr}")),
            )
        })
}
