//! Server rotation. Selection is blind: the selector has no knowledge of
//! which servers have answered before, it only advances a cursor and
//! applies the compiled strategy.

use log::debug;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum SelectorError {
    /// Every entry in the compiled server list failed to parse
    #[error("no parseable server uris in the compiled list")]
    Exhausted,
}

/// Picks the next candidate server URI.
///
/// The cursor advances on every call whether or not the pick is usable.
/// Unparseable entries are skipped by advancing again, bounded by the
/// list length so a fully broken list reports [`SelectorError::Exhausted`]
/// instead of spinning.
pub fn next_server(
    servers: &[&str],
    strategy: &str,
    cursor: &AtomicUsize,
) -> Result<Url, SelectorError> {
    if servers.is_empty() {
        return Err(SelectorError::Exhausted);
    }

    for _ in 0..servers.len() {
        let position = cursor.fetch_add(1, Ordering::Relaxed);
        let next = match strategy {
            // Random
            "r" => servers[rand::thread_rng().gen_range(0..servers.len())],
            // Random within the scheme of the sequential pick
            "rd" => random_scheme_peer(servers, servers[position % servers.len()]),
            // Sequential, also the fallback for unknown strategies
            _ => servers[position % servers.len()],
        };

        match Url::parse(next) {
            Ok(uri) => return Ok(uri),
            Err(err) => {
                debug!("Skipping unparseable server uri {next}: {err}");
            }
        }
    }

    Err(SelectorError::Exhausted)
}

/// Picks a random server sharing the scheme of `base`. Falls back to
/// `base` itself when it doesn't parse; the caller skips it either way.
fn random_scheme_peer<'a>(servers: &[&'a str], base: &'a str) -> &'a str {
    let scheme = match Url::parse(base) {
        Ok(uri) => uri.scheme().to_string(),
        Err(_) => return base,
    };

    let pool: Vec<&str> = servers
        .iter()
        .copied()
        .filter(|server| {
            Url::parse(server)
                .map(|uri| uri.scheme() == scheme)
                .unwrap_or(false)
        })
        .collect();

    // The base itself parses so the pool is never empty
    pool[rand::thread_rng().gen_range(0..pool.len())]
}
