//! Process-wide connection state.
//!
//! These cells are created unset, written by the supervisor whenever a
//! connect succeeds and only ever overwritten, never destroyed. Readers
//! accept eventual consistency; nothing here is on a hot path.

use crate::transports::Connection;
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicI64, AtomicUsize, Ordering},
    Arc,
};

/// URI of the server the active connection was established against.
/// Empty until the first successful connect.
static ACTIVE_C2: RwLock<String> = RwLock::new(String::new());

/// The currently active connection if any
static ACTIVE_CONNECTION: RwLock<Option<Arc<Connection>>> = RwLock::new(None);

/// Proxy URL resolved by the HTTP carrier if one is in use
static PROXY_URL: RwLock<Option<String>> = RwLock::new(None);

/// Rotation cursor for the server selector
static SERVER_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Runtime override of the compiled reconnect interval in seconds,
/// -1 while unset
static RECONNECT_OVERRIDE: AtomicI64 = AtomicI64::new(-1);

/// Runtime override of the compiled poll interval in seconds, -1 while unset
static POLL_OVERRIDE: AtomicI64 = AtomicI64::new(-1);

pub fn active_c2() -> String {
    ACTIVE_C2.read().clone()
}

pub fn set_active_c2(uri: &str) {
    *ACTIVE_C2.write() = uri.to_string();
}

pub fn active_connection() -> Option<Arc<Connection>> {
    ACTIVE_CONNECTION.read().clone()
}

pub fn set_active_connection(connection: Arc<Connection>) {
    *ACTIVE_CONNECTION.write() = Some(connection);
}

/// Clears the active connection slot if it still refers to `connection`.
/// Called from connection cleanup so a replaced connection doesn't clear
/// its successor.
pub fn clear_active_connection(connection: &Connection) {
    let mut active = ACTIVE_CONNECTION.write();
    if let Some(current) = active.as_ref() {
        if std::ptr::eq(Arc::as_ptr(current), connection as *const Connection) {
            *active = None;
        }
    }
}

pub fn proxy_url() -> Option<String> {
    PROXY_URL.read().clone()
}

#[cfg(feature = "http")]
pub fn set_proxy_url(url: String) {
    *PROXY_URL.write() = Some(url);
}

/// The cursor the server selector rotates with
pub fn server_cursor() -> &'static AtomicUsize {
    &SERVER_CURSOR
}

pub fn reconnect_override() -> Option<u64> {
    match RECONNECT_OVERRIDE.load(Ordering::Relaxed) {
        value if value < 0 => None,
        value => Some(value as u64),
    }
}

pub fn set_reconnect_override(seconds: u64) {
    RECONNECT_OVERRIDE.store(seconds as i64, Ordering::Relaxed);
}

pub fn poll_override() -> Option<u64> {
    match POLL_OVERRIDE.load(Ordering::Relaxed) {
        value if value < 0 => None,
        value => Some(value as u64),
    }
}

pub fn set_poll_override(seconds: u64) {
    POLL_OVERRIDE.store(seconds as i64, Ordering::Relaxed);
}
