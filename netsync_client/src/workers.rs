//! Receive workers.
//!
//! One task per channel blocks on its socket, decodes what arrives, and hands
//! anything that touches gameplay state to the dispatch queue. Per-message
//! failures are logged and skipped; only the loss of the control stream ends a
//! session from in here.
//!
//! Each worker races its read against its channel's cancellation token and
//! checks the token first, so a cancelled worker never handles another
//! message. Cancelling drops the read future and then the socket half.

use std::sync::Arc;
use std::time::Instant;

use netsync_shared::{
    net::{ReliableReader, UnreliableConn, MAX_FRAME_LEN},
    protocol::{decode, now_millis, AssignId, ClientId, Message, Payload, Snapshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    dispatch::Dispatcher,
    lifecycle::{Channel, DisconnectReason, Link, SessionStamp},
    world::RemoteWorld,
};

/// What both workers share.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub link: Arc<Link>,
    pub dispatcher: Dispatcher<RemoteWorld>,
    pub data: Arc<UnreliableConn>,
}

/// Identity announcement for the consumer, dropped if its session ended first.
fn identified_job(stamp: SessionStamp) -> impl FnOnce(&mut RemoteWorld) + Send + 'static {
    move |world: &mut RemoteWorld| {
        if world.is_current(stamp.generation) {
            world.on_identified(stamp.id);
        } else {
            debug!(client_id = %stamp.id, "Dropping identity from an ended session");
        }
    }
}

/// Snapshot application, dropped if its session ended first.
fn snapshot_job(
    stamp: SessionStamp,
    snapshot: Snapshot,
    received_ms: f64,
) -> impl FnOnce(&mut RemoteWorld) + Send + 'static {
    move |world: &mut RemoteWorld| {
        if world.is_current(stamp.generation) {
            world.apply_snapshot(snapshot, stamp.id, received_ms);
        } else {
            debug!(
                timestamp = snapshot.timestamp,
                "Dropping snapshot from an ended session"
            );
        }
    }
}

fn pong_job(
    generation: u64,
    sent_at: Option<Instant>,
    received_at: Instant,
) -> impl FnOnce(&mut RemoteWorld) + Send + 'static {
    move |world: &mut RemoteWorld| {
        if world.is_current(generation) {
            world.on_pong(sent_at, received_at);
        }
    }
}

/// Sends one liveness probe on the state channel.
pub(crate) async fn send_probe(ctx: &WorkerContext, id: ClientId) {
    ctx.link.note_probe_sent();
    match ctx.data.send(&Message::ping(id)).await {
        Ok(()) => debug!(client_id = %id, "Sent liveness probe"),
        Err(e) => warn!(error = %e, "Failed to send liveness probe"),
    }
}

/// Control channel loop. Ends the session with `RemoteClosed` when the stream
/// closes or fails.
pub(crate) async fn run_control(
    mut reader: ReliableReader,
    ctx: WorkerContext,
    token: CancellationToken,
) {
    debug!("Control worker started");
    loop {
        let frame = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Control worker cancelled");
                return;
            }
            frame = reader.recv_frame() => frame,
        };

        match frame {
            Ok(Some(bytes)) if bytes.is_empty() => continue,
            Ok(Some(bytes)) => handle_control(&ctx, &bytes).await,
            Ok(None) => {
                info!("Server closed the control channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Control channel failed");
                break;
            }
        }
    }

    // Dropping our own half is the close; only the data worker needs a nudge.
    drop(reader);
    ctx.link
        .teardown(DisconnectReason::RemoteClosed, Some(Channel::Control));
}

async fn handle_control(ctx: &WorkerContext, bytes: &[u8]) {
    let msg = match decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable control frame");
            return;
        }
    };

    match msg.payload {
        Payload::AssignId(AssignId { client_id }) => match ctx.link.assign_identity(client_id) {
            Ok(true) => {
                info!(client_id = %client_id, "Identity assigned");
                // Torn down already if there is no stamp.
                if let Some(stamp) = ctx.link.session() {
                    ctx.dispatcher.dispatch(identified_job(stamp));
                    send_probe(ctx, stamp.id).await;
                }
            }
            Ok(false) => debug!(client_id = %client_id, "Repeated identity assignment"),
            Err(e) => warn!(error = %e, "Ignoring identity assignment"),
        },
        Payload::Unknown { tag } => {
            warn!(%tag, "Dropping control message with unknown type");
        }
        other => {
            warn!(tag = other.tag(), "Unexpected message on control channel");
        }
    }
}

/// State channel loop. Runs until cancelled; socket errors are logged and
/// the loop keeps reading.
pub(crate) async fn run_data(ctx: WorkerContext, token: CancellationToken) {
    debug!("Data worker started");
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Data worker cancelled");
                return;
            }
            received = ctx.data.recv_into(&mut buf) => received,
        };

        match received {
            Ok(0) => continue,
            Ok(n) => handle_datagram(&ctx, &buf[..n]),
            Err(e) => {
                if token.is_cancelled() {
                    return;
                }
                warn!(error = %e, "State channel receive failed");
                // ICMP errors on a connected UDP socket can repeat quickly.
                tokio::task::yield_now().await;
            }
        }
    }
}

fn handle_datagram(ctx: &WorkerContext, bytes: &[u8]) {
    let msg = match decode(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, len = bytes.len(), "Dropping undecodable datagram");
            return;
        }
    };

    match msg.payload {
        Payload::Pong => {
            let received_at = Instant::now();
            let generation = ctx.link.generation();
            let sent_at = ctx.link.take_probe_sent();
            ctx.dispatcher.dispatch(pong_job(generation, sent_at, received_at));
        }
        Payload::ServerSnapshot(snapshot) => {
            let Some(stamp) = ctx.link.session() else {
                warn!(
                    timestamp = snapshot.timestamp,
                    "Protocol violation: snapshot before identity assignment, ignoring"
                );
                return;
            };
            let received_ms = now_millis() as f64;
            ctx.dispatcher.dispatch(snapshot_job(stamp, snapshot, received_ms));
        }
        Payload::Unknown { tag } => {
            warn!(%tag, "Dropping datagram with unknown type");
        }
        other => {
            warn!(tag = other.tag(), "Unexpected message on state channel");
        }
    }
}
