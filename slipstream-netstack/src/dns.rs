//! Minimal DNS responder.
//!
//! UDP/53 queries read off the TUN are forwarded verbatim to the configured
//! upstream resolver over a short-lived socket; the answer is injected back
//! into the TUN with the endpoints swapped. The query ID inside the payload
//! passes through untouched.

use crate::error::{NetStackError, Result};
use crate::packet::build_ipv4_udp;
use bytes::BytesMut;
use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Upstream exchange deadline; the device retries on a drop.
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);
/// Minimum length of a DNS message header.
const DNS_HEADER_LEN: usize = 12;

/// Identity of one in-flight query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DnsKey {
    pub src_port: u16,
    pub query_id: u16,
}

/// Forwards device DNS queries to an upstream resolver.
pub struct DnsResponder {
    upstream: SocketAddr,
    inflight: DashMap<DnsKey, Instant>,
}

impl DnsResponder {
    pub fn new(upstream: Ipv4Addr) -> Self {
        Self {
            upstream: SocketAddr::from((upstream, 53)),
            inflight: DashMap::new(),
        }
    }

    /// Extract the query ID from a DNS payload.
    pub fn query_id(payload: &[u8]) -> Result<u16> {
        if payload.len() < DNS_HEADER_LEN {
            return Err(NetStackError::PacketTooShort {
                expected: DNS_HEADER_LEN,
                actual: payload.len(),
            });
        }
        Ok(u16::from_be_bytes([payload[0], payload[1]]))
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Drop transactions older than the exchange deadline.
    fn prune(&self) {
        self.inflight
            .retain(|_, created| created.elapsed() < DNS_TIMEOUT);
    }

    /// Forward one query and write the reply packet into the TUN channel.
    ///
    /// `src` is the querying device endpoint, `dst` the resolver address the
    /// device targeted; the reply swaps them.
    pub async fn handle_query(
        &self,
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
        payload: &[u8],
        tun_tx: mpsc::Sender<BytesMut>,
    ) -> Result<()> {
        let query_id = Self::query_id(payload)?;
        let key = DnsKey {
            src_port: src.1,
            query_id,
        };
        self.prune();
        self.inflight.insert(key, Instant::now());
        trace!("dns query id={:#06x} from :{}", query_id, src.1);

        let result = self.exchange(payload).await;
        self.inflight.remove(&key);

        let response = result?;
        let reply = build_ipv4_udp(dst.0, src.0, dst.1, src.1, &response);
        tun_tx
            .send(BytesMut::from(&reply[..]))
            .await
            .map_err(|_| NetStackError::ChannelClosed)?;
        debug!(
            "dns reply id={:#06x}, {} bytes to :{}",
            query_id,
            response.len(),
            src.1
        );
        Ok(())
    }

    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(query, self.upstream).await?;

        let mut buf = vec![0u8; 4096];
        let (n, _) = tokio::time::timeout(DNS_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| NetStackError::DnsTimeout)??;
        buf.truncate(n);
        Ok(buf)
    }
}
