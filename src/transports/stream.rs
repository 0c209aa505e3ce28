//! Shared wiring for byte-stream carriers.
//!
//! Every carrier that presents a plain duplex byte stream (mTLS, TCP
//! pivot, named pipe) gets the same machinery: a writer task draining
//! the outbound queue and emitting framed envelopes plus periodic pings,
//! and a reader task decoding frames into the inbound queue. Either task
//! triggers the connection cleanup on failure and both observe it
//! through the control token.

use super::{CleanupFn, Connection, QUEUE_SIZE};
use crate::envelope::{Envelope, EnvelopeCodec};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// Builds a [`Connection`] over the provided framed stream and spawns
/// its writer and reader tasks. The stream halves are dropped, closing
/// the carrier socket, once both tasks have observed the teardown.
pub(super) fn spawn<S>(
    io: Framed<S, EnvelopeCodec>,
    ping_interval: Duration,
    cleanup: CleanupFn,
) -> Arc<Connection>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (send_tx, mut send_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let (recv_tx, recv_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let ctrl = CancellationToken::new();

    let connection = Connection::new(send_tx, recv_rx, ctrl.clone(), cleanup);

    let (mut sink, mut stream) = io.split();

    // Writer: drains the outbound queue and keeps the channel alive with
    // pings while it is idle
    let writer_ctrl = ctrl.clone();
    let writer_connection = connection.clone();
    tokio::spawn(async move {
        let mut ping = time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = writer_ctrl.cancelled() => break,
                envelope = send_rx.recv() => {
                    let envelope = match envelope {
                        Some(value) => value,
                        // All senders dropped, nothing left to write
                        None => break,
                    };
                    // Writes stay cancellable so a stalled socket can't
                    // pin this task past cleanup
                    tokio::select! {
                        _ = writer_ctrl.cancelled() => break,
                        result = sink.send(envelope) => {
                            if result.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = ping.tick() => {
                    tokio::select! {
                        _ = writer_ctrl.cancelled() => break,
                        result = sink.send(Envelope::ping()) => {
                            if result.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        writer_connection.cleanup();
    });

    // Reader: decodes frames into the inbound queue. A full queue blocks
    // the read loop which stops draining the socket, backpressure flows
    // all the way down to the peer.
    let reader_ctrl = ctrl;
    let reader_connection = connection.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader_ctrl.cancelled() => break,
                result = stream.next() => {
                    let envelope = match result {
                        Some(Ok(envelope)) => envelope,
                        Some(Err(err)) => {
                            debug!("Envelope read failed: {err}");
                            break;
                        }
                        // Graceful end of stream
                        None => break,
                    };
                    // The enqueue itself must stay cancellable: a full
                    // queue with a gone consumer would otherwise pin
                    // this task and its socket half forever
                    tokio::select! {
                        _ = reader_ctrl.cancelled() => break,
                        sent = recv_tx.send(envelope) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        reader_connection.cleanup();
    });

    connection
}
