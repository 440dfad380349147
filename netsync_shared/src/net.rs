//! Transport primitives.
//!
//! - A reliable control channel over TCP with length-prefixed frames.
//! - An unreliable state channel over UDP, one message per datagram.
//!
//! Both carry the JSON messages from [`crate::protocol`]. The reliable stream
//! splits into a reader (owned by the receive worker) and a writer (owned by
//! whoever sends), so no lock sits between them.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
};

use crate::{
    error::NetError,
    protocol::{encode, Message},
};

/// Largest frame or datagram accepted.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    writer
        .write_all(&buf)
        .await
        .map_err(|e| NetError::transport("tcp write", e))?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly on a frame
/// boundary. A close partway through the length prefix is a transport error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, NetError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader
            .read(&mut len_buf[filled..])
            .await
            .map_err(|e| NetError::transport("tcp read len", e))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NetError::transport(
                "tcp read len",
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream closed after {filled} of 4 length bytes"),
                ),
            ));
        }
        filled += n;
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| NetError::transport("tcp read payload", e))?;
    Ok(Some(Bytes::from(payload)))
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: &str) -> Result<Self, NetError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetError::transport("tcp connect", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| NetError::transport("tcp nodelay", e))?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), NetError> {
        let payload = encode(msg)?;
        write_frame(&mut self.stream, &payload).await
    }

    /// Frames and sends an already-encoded body.
    pub async fn send_raw(&mut self, body: &[u8]) -> Result<(), NetError> {
        write_frame(&mut self.stream, body).await
    }

    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, NetError> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, NetError> {
        self.stream
            .peer_addr()
            .map_err(|e| NetError::transport("tcp peer_addr", e))
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { half: read }, ReliableWriter { half: write })
    }
}

/// Read half of a [`ReliableConn`]. Dropping it closes the read side.
#[derive(Debug)]
pub struct ReliableReader {
    half: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv_frame(&mut self) -> Result<Option<Bytes>, NetError> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    half: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &Message) -> Result<(), NetError> {
        let payload = encode(msg)?;
        write_frame(&mut self.half, &payload).await
    }

    /// Sends FIN so the peer sees a clean close.
    pub async fn shutdown(&mut self) -> Result<(), NetError> {
        self.half
            .shutdown()
            .await
            .map_err(|e| NetError::transport("tcp shutdown", e))
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetError::transport("udp bind", e))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| NetError::transport("udp connect", e))?;
        Ok(Self { socket, peer })
    }

    /// Fire-and-forget: one message, one datagram.
    pub async fn send(&self, msg: &Message) -> Result<(), NetError> {
        let payload = encode(msg)?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(NetError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }
        self.socket
            .send(&payload)
            .await
            .map_err(|e| NetError::transport("udp send", e))?;
        Ok(())
    }

    /// Receives one datagram into `buf`, returning its length.
    pub async fn recv_into(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        self.socket
            .recv(buf)
            .await
            .map_err(|e| NetError::transport("udp recv", e))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.socket
            .local_addr()
            .map_err(|e| NetError::transport("udp local_addr", e))
    }
}

/// TCP listener handing out [`ReliableConn`]s.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self, NetError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetError::transport("tcp bind", e))?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> Result<(ReliableConn, SocketAddr), NetError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| NetError::transport("tcp accept", e))?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetError> {
        self.listener
            .local_addr()
            .map_err(|e| NetError::transport("tcp local_addr", e))
    }
}
