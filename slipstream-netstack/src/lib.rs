//! Slipstream network stack.
//!
//! A userspace TCP/UDP packet engine for TUN-based tunnelling through the
//! Slipstream relay:
//! - IPv4/TCP/UDP parsing and reply-packet emission with correct checksums
//! - a per-flow TCP state machine terminated locally against the device
//! - a minimal DNS responder forwarding UDP/53 to an upstream resolver
//! - the packet engine wiring flows onto pooled relay sessions
//! - TUN device plumbing over a host-provided fd and the lifecycle
//!   supervisor that owns it all
//!
//! # Platform Requirements
//!
//! The host provisions the TUN interface (address 10.0.0.2/24, default
//! route, MTU 1500) and hands over the packet fd; this crate never creates
//! network interfaces itself.

pub mod dns;
pub mod engine;
pub mod error;
pub mod flow;
pub mod packet;
#[cfg(unix)]
pub mod supervisor;
#[cfg(unix)]
pub mod tun;

#[cfg(all(test, unix))]
mod tests;

pub use dns::{DnsKey, DnsResponder, DNS_TIMEOUT};
pub use engine::{EngineStats, PacketEngine, CONNECT_TIMEOUT};
pub use error::{NetStackError, Result};
pub use flow::{FlowKey, FlowTable, TcpFlow, TcpFlowState};
pub use packet::{
    build_ipv4_tcp, build_ipv4_udp, parse_packet, ParsedPacket, TcpFlags, TcpSegment, Transport,
    UdpDatagram, DEFAULT_MTU,
};
#[cfg(unix)]
pub use supervisor::{RevokeHandle, Supervisor, SupervisorState};
#[cfg(unix)]
pub use tun::{TunConfig, TunDevice};
