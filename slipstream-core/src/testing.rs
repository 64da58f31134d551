//! In-process mock relay for tests.
//!
//! Speaks the real wire protocol (PSK handshake, sealed frames, CONNECT
//! reply byte) over a plain-TCP WebSocket so session, pool and engine tests
//! can run without TLS or a network.

use crate::crypto;
use crate::error::Result;
use crate::session::SecureSession;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

/// What the relay does with frames after a completed handshake.
#[derive(Debug, Clone)]
pub enum RelayBehavior {
    /// Decrypt every frame and echo it back sealed.
    Echo,
    /// Treat the first frame as a CONNECT payload, reply with the given
    /// status byte, then echo everything after it.
    Connect(u8),
    /// Close the WebSocket immediately after the handshake.
    CloseAfterHandshake,
}

#[derive(Default)]
struct Recorded {
    connect_payloads: Vec<Vec<u8>>,
}

pub struct MockRelay {
    addr: SocketAddr,
    psk: [u8; 32],
    recorded: Arc<Mutex<Recorded>>,
}

impl MockRelay {
    pub fn echo_behavior() -> RelayBehavior {
        RelayBehavior::Echo
    }

    pub fn connect_behavior(status: u8) -> RelayBehavior {
        RelayBehavior::Connect(status)
    }

    pub fn close_behavior() -> RelayBehavior {
        RelayBehavior::CloseAfterHandshake
    }

    /// Bind on a loopback port and serve connections with `behavior`.
    pub async fn spawn(psk: [u8; 32], behavior: RelayBehavior) -> Self {
        Self::spawn_inner(psk, behavior, 32).await
    }

    /// Like [`spawn`] but the relay sends a server_public of the given
    /// length, for handshake violation tests.
    pub async fn spawn_with_public_len(psk: [u8; 32], public_len: usize) -> Self {
        Self::spawn_inner(psk, RelayBehavior::Echo, public_len).await
    }

    async fn spawn_inner(psk: [u8; 32], behavior: RelayBehavior, public_len: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock relay");
        let addr = listener.local_addr().expect("mock relay addr");
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let recorded_task = recorded.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let behavior = behavior.clone();
                let recorded = recorded_task.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        let _ = serve(ws, psk, behavior, public_len, recorded).await;
                    }
                });
            }
        });

        Self {
            addr,
            psk,
            recorded,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Upgrade a plain WebSocket to this relay without running the PSK
    /// handshake, so tests can drive `establish` themselves.
    pub async fn dial_raw(&self) -> WebSocketStream<TcpStream> {
        let stream = TcpStream::connect(self.addr).await.expect("dial mock relay");
        let url = format!("ws://{}/tunnel", self.addr);
        let (ws, _) = tokio_tungstenite::client_async(url, stream)
            .await
            .expect("upgrade to mock relay");
        ws
    }

    /// Establish a ready session against this relay.
    pub async fn dial(&self) -> Result<SecureSession> {
        let ws = self.dial_raw().await;
        SecureSession::establish(ws, &self.psk).await
    }

    /// The most recent CONNECT payload the relay observed (plaintext).
    pub async fn last_connect_payload(&self) -> Vec<u8> {
        self.recorded
            .lock()
            .await
            .connect_payloads
            .last()
            .cloned()
            .expect("no CONNECT observed")
    }
}

async fn serve(
    mut ws: WebSocketStream<TcpStream>,
    psk: [u8; 32],
    behavior: RelayBehavior,
    public_len: usize,
    recorded: Arc<Mutex<Recorded>>,
) -> Result<()> {
    // Handshake, server side: the key split is mirrored relative to the
    // client, so the client's send key is our recv key.
    let client_public = match ws.next().await {
        Some(Ok(Message::Binary(data))) => data.to_vec(),
        _ => return Ok(()),
    };

    let server_public = crypto::random_bytes(public_len)?;
    ws.send(Message::Binary(server_public.clone().into()))
        .await
        .ok();
    if client_public.len() != 32 || public_len != 32 {
        return Ok(());
    }

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(&client_public);
    salt[32..].copy_from_slice(&server_public);
    let (recv_key, send_key) = crypto::derive_keys(&psk, &salt);

    let auth = match ws.next().await {
        Some(Ok(Message::Binary(data))) => data.to_vec(),
        _ => return Ok(()),
    };
    if !crypto::ct_eq(&auth, &crypto::hmac(&recv_key, crypto::AUTH_LABEL)) {
        let _ = ws.close(None).await;
        return Ok(());
    }
    let ok_tag = crypto::hmac(&send_key, crypto::AUTH_OK_LABEL);
    ws.send(Message::Binary(ok_tag.to_vec().into())).await.ok();

    match behavior {
        RelayBehavior::CloseAfterHandshake => {
            let _ = ws.close(None).await;
            Ok(())
        }
        RelayBehavior::Echo => relay_frames(&mut ws, &recv_key, &send_key).await,
        RelayBehavior::Connect(status) => {
            if let Some(payload) = next_plaintext(&mut ws, &recv_key).await {
                recorded.lock().await.connect_payloads.push(payload);
                let reply = crypto::seal(&send_key, &[status])?;
                ws.send(Message::Binary(reply.into())).await.ok();
                if status == 0x00 {
                    return relay_frames(&mut ws, &recv_key, &send_key).await;
                }
            }
            Ok(())
        }
    }
}

async fn next_plaintext(
    ws: &mut WebSocketStream<TcpStream>,
    recv_key: &[u8; 32],
) -> Option<Vec<u8>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(frame))) => return crypto::open(recv_key, &frame).ok(),
            Some(Ok(Message::Ping(data))) => {
                let _ = ws.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(_)) | Some(Err(_)) | None => return None,
        }
    }
}

async fn relay_frames(
    ws: &mut WebSocketStream<TcpStream>,
    recv_key: &[u8; 32],
    send_key: &[u8; 32],
) -> Result<()> {
    while let Some(plaintext) = next_plaintext(ws, recv_key).await {
        let frame = crypto::seal(send_key, &plaintext)?;
        if ws.send(Message::Binary(frame.into())).await.is_err() {
            break;
        }
    }
    let _ = ws.close(None).await;
    Ok(())
}
