//! Slipstream core: secure relay sessions and the pool that caches them.
//!
//! This crate holds everything below the packet engine:
//! - crypto primitives for the relay protocol (HKDF key derivation,
//!   AES-256-GCM frames, HMAC authentication)
//! - the secure session: TLS + WebSocket transport with the PSK handshake,
//!   keepalive and idle supervision
//! - a bounded pool of ready sessions
//! - configuration parsing/validation, error types and logging setup
//!
//! The packet engine and TUN plumbing live in `slipstream-netstack`.

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod pool;
pub mod session;
pub mod tls;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{decode_psk, ConfigFile, ProxyConfig, PSK_LEN};
pub use error::{Error, Result};
pub use pool::{RelayConnector, SessionConnector, SessionPool, DEFAULT_POOL_CAPACITY};
pub use session::{SecureSession, SessionState};
