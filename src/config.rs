//! Compile-time configuration for the implant.
//!
//! Every value in this module is a string literal that the operator build
//! pipeline substitutes before compilation; the values checked in here are
//! development placeholders. Numeric fields are parsed at first use and
//! fall back to documented defaults when the substituted value fails to
//! parse, so a half-broken substitution still produces a working implant.

use log::LevelFilter;
use std::time::Duration;

/// The implant version extracted from the Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Candidate command-and-control servers. The scheme of each URI selects
/// the carrier protocol used to reach it.
pub const SERVERS: &[&str] = &["mtls://127.0.0.1:8888"];

/// Server rotation strategy: "s" sequential, "r" random, "rd" random
/// within the scheme of the sequential pick.
pub const CONNECTION_STRATEGY: &str = "s";

/// Maximum failed connection attempts before the implant gives up.
const MAX_CONNECTION_ERRORS: &str = "1000";

/// Seconds to sleep between failed connection attempts.
const RECONNECT_INTERVAL: &str = "60";

/// Seconds between poll queries for push-by-polling carriers.
const POLL_INTERVAL: &str = "1";

/// Logging level for this build. "off" disables logging entirely which is
/// what release builds ship with.
const LOG_LEVEL: &str = "debug";

/// CA certificate the server's mTLS listener certificate must chain to.
#[cfg(feature = "mtls")]
pub const MTLS_CA_CERT_PEM: &str = "";

/// Client certificate presented during the mTLS handshake.
#[cfg(feature = "mtls")]
pub const MTLS_CLIENT_CERT_PEM: &str = "";

/// Private key for [`MTLS_CLIENT_CERT_PEM`].
#[cfg(feature = "mtls")]
pub const MTLS_CLIENT_KEY_PEM: &str = "";

/// Implant WireGuard private key (base64).
#[cfg(feature = "wg")]
pub const WG_IMPLANT_PRIVATE_KEY: &str = "";

/// Server WireGuard public key (base64).
#[cfg(feature = "wg")]
pub const WG_SERVER_PUBLIC_KEY: &str = "";

/// Tunnel-side address assigned to this implant.
#[cfg(feature = "wg")]
pub const WG_IMPLANT_ADDRESS: &str = "100.64.0.2";

/// Tunnel-side address of the server peer.
#[cfg(feature = "wg")]
pub const WG_PEER_ADDRESS: &str = "100.64.0.1";

/// TCP port the envelope listener binds inside the tunnel.
#[cfg(feature = "wg")]
const WG_COMMS_PORT: &str = "8888";

/// Path used to register a new HTTP session.
#[cfg(feature = "http")]
pub const HTTP_SESSION_PATH: &str = "/authenticate";

/// Path outbound envelopes are posted to.
#[cfg(feature = "http")]
pub const HTTP_SEND_PATH: &str = "/session";

/// Path polled for inbound envelopes.
#[cfg(feature = "http")]
pub const HTTP_POLL_PATH: &str = "/poll";

/// Parses the compiled max connection error count, defaulting to 1000
pub fn max_connection_errors() -> usize {
    MAX_CONNECTION_ERRORS.parse().unwrap_or(1000)
}

/// Parses the compiled reconnect interval, defaulting to 60 seconds
pub fn reconnect_interval() -> Duration {
    parse_seconds(RECONNECT_INTERVAL, 60)
}

/// Parses the compiled poll interval, defaulting to 1 second
pub fn poll_interval() -> Duration {
    parse_seconds(POLL_INTERVAL, 1)
}

/// Parses the compiled logging level, defaulting to [`LevelFilter::Off`]
pub fn log_level() -> LevelFilter {
    LOG_LEVEL.parse().unwrap_or(LevelFilter::Off)
}

/// Parses the compiled WireGuard comms port, defaulting to 8888
#[cfg(feature = "wg")]
pub fn wg_comms_port() -> u16 {
    WG_COMMS_PORT.parse().unwrap_or(8888)
}

/// Parses a seconds count from a substituted literal falling back to
/// `default` when the substitution produced something unparseable
fn parse_seconds(raw: &str, default: u64) -> Duration {
    Duration::from_secs(raw.parse().unwrap_or(default))
}
