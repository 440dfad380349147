//! `netsync_tests`
//!
//! A scripted loopback server for driving [`netsync_client::NetClient`]
//! through real sockets. The test decides what the server says and when;
//! nothing here simulates gameplay.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use netsync_client::NetClient;
use netsync_shared::{
    config::NetConfig,
    net::{ReliableConn, ReliableListener, MAX_FRAME_LEN},
    protocol::{decode, encode, Message},
};
use tokio::net::UdpSocket;

/// How long harness calls wait for the client before failing.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Server side of one test session.
pub struct ScriptedServer {
    tcp: ReliableListener,
    udp: UdpSocket,
    control: Option<ReliableConn>,
    /// Learned from the first datagram the client sends.
    client_data_addr: Option<SocketAddr>,
}

impl ScriptedServer {
    /// Binds both channels on ephemeral loopback ports and returns a client
    /// config pointing at them.
    pub async fn bind() -> anyhow::Result<(Self, NetConfig)> {
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let tcp = ReliableListener::bind(any).await?;
        let udp = UdpSocket::bind(any).await?;

        let cfg = NetConfig {
            host: Ipv4Addr::LOCALHOST.to_string(),
            control_port: tcp.local_addr()?.port(),
            data_port: udp.local_addr()?.port(),
            connect_timeout_ms: 2_000,
            ..Default::default()
        };

        Ok((
            Self {
                tcp,
                udp,
                control: None,
                client_data_addr: None,
            },
            cfg,
        ))
    }

    /// Accepts the client's control connection.
    pub async fn accept(&mut self) -> anyhow::Result<SocketAddr> {
        let (conn, addr) = tokio::time::timeout(STEP_TIMEOUT, self.tcp.accept())
            .await
            .context("timed out waiting for control connection")??;
        self.control = Some(conn);
        Ok(addr)
    }

    fn control(&mut self) -> anyhow::Result<&mut ReliableConn> {
        self.control.as_mut().context("no control connection")
    }

    /// Sends one message on the control channel.
    pub async fn send_control(&mut self, msg: &Message) -> anyhow::Result<()> {
        self.control()?.send(msg).await?;
        Ok(())
    }

    /// Sends an arbitrary frame body on the control channel.
    pub async fn send_control_raw(&mut self, body: &[u8]) -> anyhow::Result<()> {
        self.control()?.send_raw(body).await?;
        Ok(())
    }

    /// Closes the control connection from the server side.
    pub async fn close_control(&mut self) -> anyhow::Result<()> {
        if let Some(conn) = self.control.take() {
            let (_reader, mut writer) = conn.into_split();
            writer.shutdown().await?;
        }
        Ok(())
    }

    /// Waits for the client to close the control connection.
    pub async fn expect_control_closed(&mut self) -> anyhow::Result<()> {
        let conn = self.control()?;
        match tokio::time::timeout(STEP_TIMEOUT, conn.recv_frame())
            .await
            .context("timed out waiting for control close")?
        {
            Ok(None) => Ok(()),
            Ok(Some(frame)) => anyhow::bail!("expected close, got a {} byte frame", frame.len()),
            // A reset is as good as a close here.
            Err(e) if e.is_transport() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Receives and decodes the next datagram. Remembers the sender so later
    /// datagrams can be sent back.
    pub async fn recv_datagram(&mut self) -> anyhow::Result<Message> {
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        let (n, from) = tokio::time::timeout(STEP_TIMEOUT, self.udp.recv_from(&mut buf))
            .await
            .context("timed out waiting for datagram")??;
        self.client_data_addr = Some(from);
        Ok(decode(&buf[..n])?)
    }

    /// Sends one message to the client's state channel.
    pub async fn send_datagram(&self, msg: &Message) -> anyhow::Result<()> {
        let bytes = encode(msg)?;
        self.send_datagram_raw(bytes).await
    }

    /// Sends arbitrary bytes to the client's state channel.
    pub async fn send_datagram_raw(&self, bytes: impl Into<Bytes>) -> anyhow::Result<()> {
        let to = self
            .client_data_addr
            .context("client data address unknown; receive a datagram first")?;
        let bytes: Bytes = bytes.into();
        self.udp.send_to(&bytes, to).await?;
        Ok(())
    }

    pub fn client_data_addr(&self) -> Option<SocketAddr> {
        self.client_data_addr
    }

    /// Targets the client's state channel before it has sent anything.
    /// Unspecified addresses are rewritten to loopback.
    pub fn set_client_data_addr(&mut self, addr: SocketAddr) {
        let addr = if addr.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        } else {
            addr
        };
        self.client_data_addr = Some(addr);
    }
}

/// Ticks `client` until `cond` holds or [`STEP_TIMEOUT`] passes.
pub async fn wait_until(
    client: &mut NetClient,
    mut cond: impl FnMut(&NetClient) -> bool,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        client.tick(1.0 / 60.0);
        if cond(client) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not reached within {STEP_TIMEOUT:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}
