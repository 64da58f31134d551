//! Secure relay session: one TLS+WebSocket connection carrying encrypted
//! frames.
//!
//! After the WebSocket upgrade the client runs a PSK handshake (random
//! publics, HKDF key derivation, HMAC mutual authentication) and from then
//! on every binary frame is an AES-256-GCM ciphertext. A reader task feeds a
//! bounded inbound queue; a keepalive task pings the relay and closes the
//! session once it has been idle too long.

use crate::config::ProxyConfig;
use crate::crypto;
use crate::error::{Error, Result};
use crate::tls;
use base64::Engine;
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// WebSocket ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// A session with no plaintext traffic for this long is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Total deadline for the PSK handshake, including internal retries.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(60);
/// Step-level handshake retries before the failure propagates.
const HANDSHAKE_RETRIES: u32 = 2;
/// Outer connect attempts and the backoff between them.
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
/// Read deadline for the reply frame of a request/response exchange.
pub const RECV_DEADLINE: Duration = Duration::from_secs(30);
/// Bound on the inbound decrypted-frame queue.
const INBOUND_QUEUE: usize = 64;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

struct Shared {
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SessionState>,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn new() -> (Arc<Self>, watch::Receiver<SessionState>) {
        let (status_tx, status_rx) = watch::channel(SessionState::Fresh);
        let shared = Arc::new(Self {
            state: Mutex::new(SessionState::Fresh),
            status_tx,
            last_activity: Mutex::new(Instant::now()),
        });
        (shared, status_rx)
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        // Closed is terminal.
        if *state == SessionState::Closed || *state == next {
            return;
        }
        trace!("session state {:?} -> {:?}", *state, next);
        *state = next;
        let _ = self.status_tx.send(next);
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

type BoxedSink = Box<dyn Sink<Message, Error = WsError> + Send + Unpin>;
type SharedSink = Arc<AsyncMutex<BoxedSink>>;

/// One authenticated, encrypted WebSocket session to the relay.
pub struct SecureSession {
    shared: Arc<Shared>,
    status_rx: watch::Receiver<SessionState>,
    send_key: [u8; crypto::KEY_LEN],
    sink: SharedSink,
    inbound: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    reader: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl SecureSession {
    /// Connect to the relay from config: TCP, TLS (SNI from config), the
    /// WebSocket upgrade and the PSK handshake. Retries the whole attempt
    /// up to three times with 1 s / 2 s backoff.
    pub async fn connect(config: &ProxyConfig) -> Result<Self> {
        let mut last_err = Error::transport("connect never attempted");
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                let backoff =
                    CONNECT_BACKOFF[(attempt as usize - 1).min(CONNECT_BACKOFF.len() - 1)];
                debug!("relay connect attempt {} after {:?}", attempt + 1, backoff);
                tokio::time::sleep(backoff).await;
            }
            match Self::connect_once(config).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_recoverable() => {
                    warn!("relay connect attempt {} failed: {}", attempt + 1, e);
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn connect_once(config: &ProxyConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.relay_address, config.relay_port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::transport(format!("TCP connect to {} failed: {}", addr, e)))?;
        let _ = tcp.set_nodelay(true);

        let connector =
            tokio_rustls::TlsConnector::from(tls::client_config(config.verify_certificates));
        let tls_stream = connector
            .connect(tls::server_name(&config.sni_host)?, tcp)
            .await
            .map_err(|e| Error::transport(format!("TLS handshake failed: {}", e)))?;

        let request = upgrade_request(config)?;
        let (ws, _response) = tokio_tungstenite::client_async(request, tls_stream)
            .await
            .map_err(|e| Error::transport(format!("WebSocket upgrade failed: {}", e)))?;

        Self::establish(ws, &config.psk).await
    }

    /// Run the PSK handshake over an already-upgraded WebSocket stream and
    /// wire up the session tasks. Split out from [`connect`] so sessions can
    /// be established over any stream (the relay tests dial plain TCP).
    pub async fn establish<S>(mut ws: WebSocketStream<S>, psk: &[u8; 32]) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (shared, status_rx) = Shared::new();
        shared.transition(SessionState::Handshaking);

        let (send_key, recv_key) = match handshake(&mut ws, psk).await {
            Ok(keys) => keys,
            Err(e) => {
                shared.transition(SessionState::Closed);
                let _ = ws.close(None).await;
                return Err(e);
            }
        };

        let (sink, stream) = ws.split();
        let sink: SharedSink = Arc::new(AsyncMutex::new(Box::new(sink) as BoxedSink));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let reader = tokio::spawn(reader_loop(stream, inbound_tx, recv_key, shared.clone()));
        let keepalive = tokio::spawn(keepalive_loop(sink.clone(), shared.clone()));

        shared.transition(SessionState::Ready);
        shared.touch();

        Ok(Self {
            shared,
            status_rx,
            send_key,
            sink,
            inbound: AsyncMutex::new(inbound_rx),
            reader,
            keepalive,
        })
    }

    /// True iff the session is Ready for traffic.
    pub fn is_connected(&self) -> bool {
        self.shared.state() == SessionState::Ready
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Read-only status channel for lifecycle observers.
    pub fn status(&self) -> watch::Receiver<SessionState> {
        self.status_rx.clone()
    }

    /// Seal and transmit one frame.
    pub async fn send(&self, plaintext: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::SessionClosed);
        }
        let frame = crypto::seal(&self.send_key, plaintext)?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(frame.into())).await.map_err(|e| {
            self.shared.transition(SessionState::Closing);
            Error::transport_with_source("frame send failed", e)
        })?;
        self.shared.touch();
        Ok(())
    }

    /// Wait for the next inbound frame. An empty payload is the peer's EOF
    /// marker; callers close their flow gracefully on it.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(plaintext) => Ok(plaintext),
            None => {
                self.shared.transition(SessionState::Closed);
                Err(Error::SessionClosed)
            }
        }
    }

    /// [`recv`] with a deadline, for request/response exchanges.
    pub async fn recv_timeout(&self, deadline: Duration) -> Result<Vec<u8>> {
        tokio::time::timeout(deadline, self.recv())
            .await
            .map_err(|_| Error::timeout_in("no reply frame before deadline", "recv"))?
    }

    /// Ask the relay to open a TCP connection to `host:port`.
    ///
    /// Payload is a 2-byte big-endian length followed by the ASCII target;
    /// the reply is one plaintext byte, `0x00` on success.
    pub async fn send_connect(&self, host: &str, port: u16) -> Result<()> {
        let target = format!("{}:{}", host, port);
        let mut payload = Vec::with_capacity(2 + target.len());
        payload.extend_from_slice(&(target.len() as u16).to_be_bytes());
        payload.extend_from_slice(target.as_bytes());
        self.send(&payload).await?;

        let reply = self.recv_timeout(RECV_DEADLINE).await?;
        match reply.as_slice() {
            [0x00] => Ok(()),
            [code] => Err(Error::Connect { code: *code }),
            other => Err(Error::protocol(format!(
                "CONNECT reply of {} bytes",
                other.len()
            ))),
        }
    }

    /// Close the session and stop its tasks.
    pub async fn close(&self) {
        self.shared.transition(SessionState::Closing);
        {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.flush().await;
        }
        self.shared.transition(SessionState::Closed);
    }
}

impl Drop for SecureSession {
    fn drop(&mut self) {
        self.shared.transition(SessionState::Closed);
        self.reader.abort();
        self.keepalive.abort();
    }
}

async fn reader_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    recv_key: [u8; crypto::KEY_LEN],
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(frame))) => {
                shared.touch();
                match crypto::open(&recv_key, &frame) {
                    Ok(plaintext) => {
                        if inbound_tx.send(plaintext).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("inbound frame rejected: {}", e);
                        shared.transition(SessionState::Closed);
                        break;
                    }
                }
            }
            // tungstenite queues the pong reply to a ping internally.
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => shared.touch(),
            Some(Ok(Message::Close(_))) | None => {
                debug!("relay closed the WebSocket");
                shared.transition(SessionState::Closed);
                break;
            }
            Some(Ok(_)) => {
                // Text and raw frames are not part of the protocol.
                continue;
            }
            Some(Err(e)) => {
                debug!("WebSocket read error: {}", e);
                shared.transition(SessionState::Closed);
                break;
            }
        }
    }
    // Dropping the sender wakes any recv() waiter with SessionClosed.
}

async fn keepalive_loop(sink: SharedSink, shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if shared.state() != SessionState::Ready {
            break;
        }
        if shared.idle_for() >= IDLE_TIMEOUT {
            debug!("session idle for {:?}, closing", shared.idle_for());
            shared.transition(SessionState::Closing);
            let mut sink = sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.flush().await;
            shared.transition(SessionState::Closed);
            break;
        }
        let mut guard = sink.lock().await;
        if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
            drop(guard);
            shared.transition(SessionState::Closing);
            break;
        }
    }
}

/// Run the PSK handshake with retry on transient step failures, under the
/// 60 s total deadline.
async fn handshake<S>(
    ws: &mut WebSocketStream<S>,
    psk: &[u8; 32],
) -> Result<([u8; crypto::KEY_LEN], [u8; crypto::KEY_LEN])>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_DEADLINE, async {
        let mut attempt = 0;
        loop {
            match handshake_once(ws, psk).await {
                Ok(keys) => return Ok(keys),
                Err(e) if e.is_recoverable() && attempt < HANDSHAKE_RETRIES => {
                    attempt += 1;
                    warn!("handshake step failed ({}), retry {}", e, attempt);
                }
                Err(e) => return Err(e),
            }
        }
    })
    .await
    .map_err(|_| Error::timeout_in("handshake deadline exceeded", "handshake"))?
}

async fn handshake_once<S>(
    ws: &mut WebSocketStream<S>,
    psk: &[u8; 32],
) -> Result<([u8; crypto::KEY_LEN], [u8; crypto::KEY_LEN])>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_public = crypto::random_bytes(32)?;
    ws.send(Message::Binary(client_public.clone().into()))
        .await
        .map_err(|e| Error::transport_with_source("handshake send failed", e))?;

    let server_public = next_binary(ws).await?;
    if server_public.len() != 32 {
        return Err(Error::protocol(format!(
            "server_public of {} bytes",
            server_public.len()
        )));
    }

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(&client_public);
    salt[32..].copy_from_slice(&server_public);
    let (send_key, recv_key) = crypto::derive_keys(psk, &salt);

    let auth_tag = crypto::hmac(&send_key, crypto::AUTH_LABEL);
    ws.send(Message::Binary(auth_tag.to_vec().into()))
        .await
        .map_err(|e| Error::transport_with_source("auth send failed", e))?;

    let server_tag = next_binary(ws).await?;
    let expected = crypto::hmac(&recv_key, crypto::AUTH_OK_LABEL);
    if !crypto::ct_eq(&server_tag, &expected) {
        return Err(Error::auth("relay auth tag mismatch"));
    }

    Ok((send_key, recv_key))
}

async fn next_binary<S>(ws: &mut WebSocketStream<S>) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(data.to_vec()),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(other)) => {
                return Err(Error::protocol(format!(
                    "unexpected handshake frame: {:?}",
                    other
                )))
            }
            Some(Err(e)) => return Err(Error::transport_with_source("handshake read failed", e)),
            None => return Err(Error::transport("connection closed during handshake")),
        }
    }
}

fn upgrade_request(config: &ProxyConfig) -> Result<Request> {
    let uri: Uri = config
        .relay_url()
        .parse()
        .map_err(|e| Error::config(format!("invalid relay URL: {}", e)))?;

    Request::builder()
        .uri(uri)
        .header("Host", config.sni_host.as_str())
        .header("User-Agent", "SecureProxy-Android/1.0")
        .header("X-Protocol-Version", "1")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_ws_key()?)
        .body(())
        .map_err(|e| Error::config(format!("failed to build upgrade request: {}", e)))
}

fn generate_ws_key() -> Result<String> {
    let mut key = [0u8; 16];
    crypto::fill_random(&mut key)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(key))
}
