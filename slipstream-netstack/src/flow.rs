//! TCP flow table and per-flow state machine.
//!
//! A flow is one device-side TCP connection, keyed by
//! `(client_src_port, dst_ip, dst_port)`. The engine terminates the TCP
//! handshake locally and relays payload through the flow's relay session;
//! the state machine here only needs the five states that round trip takes.

use dashmap::DashMap;
use parking_lot::RwLock;
use slipstream_core::SecureSession;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

/// Flow identity as observed on the TUN side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, ":{} -> {}:{}", self.src_port, self.dst_ip, self.dst_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlowState {
    SynReceived,
    Established,
    CloseWait,
    LastAck,
    Closed,
}

/// State for one proxied TCP connection.
pub struct TcpFlow {
    pub key: FlowKey,
    state: TcpFlowState,
    session: Arc<SecureSession>,
    /// Next byte expected from the device.
    client_seq: u32,
    /// Next byte we emit toward the device.
    server_seq: u32,
    /// Device address, used as the destination of reply packets.
    src_ip: Ipv4Addr,
    alive: bool,
    bytes_tx: u64,
    bytes_rx: u64,
    last_active: Instant,
    /// Set once the session has been handed back to the pool, so teardown
    /// paths racing each other cannot release it twice.
    session_released: bool,
    /// Stops the peer->device forwarder; taken exactly once on teardown.
    forwarder_stop: Option<oneshot::Sender<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl TcpFlow {
    /// Create a flow for a device SYN carrying `client_isn`, after the relay
    /// accepted the CONNECT. The server-side ISN is a fresh CSPRNG draw.
    pub fn new(
        key: FlowKey,
        session: Arc<SecureSession>,
        src_ip: Ipv4Addr,
        client_isn: u32,
    ) -> Self {
        let isn: u32 = rand::random();
        Self {
            key,
            state: TcpFlowState::SynReceived,
            session,
            client_seq: client_isn.wrapping_add(1),
            server_seq: isn.wrapping_add(1),
            src_ip,
            alive: true,
            bytes_tx: 0,
            bytes_rx: 0,
            last_active: Instant::now(),
            session_released: false,
            forwarder_stop: None,
            forwarder: None,
        }
    }

    pub fn state(&self) -> TcpFlowState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn session(&self) -> Arc<SecureSession> {
        self.session.clone()
    }

    /// Hand the session out for release to the pool. Returns `None` when a
    /// concurrent teardown path already took it.
    pub fn take_session_for_release(&mut self) -> Option<Arc<SecureSession>> {
        if self.session_released {
            None
        } else {
            self.session_released = true;
            Some(self.session.clone())
        }
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        self.src_ip
    }

    pub fn client_seq(&self) -> u32 {
        self.client_seq
    }

    pub fn server_seq(&self) -> u32 {
        self.server_seq
    }

    /// `(seq, ack)` for the SYN-ACK: our ISN and the client ISN + 1.
    pub fn syn_ack_numbers(&self) -> (u32, u32) {
        (self.server_seq.wrapping_sub(1), self.client_seq)
    }

    pub fn set_forwarder(&mut self, stop: oneshot::Sender<()>, handle: JoinHandle<()>) {
        self.forwarder_stop = Some(stop);
        self.forwarder = Some(handle);
    }

    /// Take the forwarder stop handle and task, if still attached.
    pub fn take_forwarder(&mut self) -> Option<(oneshot::Sender<()>, JoinHandle<()>)> {
        match (self.forwarder_stop.take(), self.forwarder.take()) {
            (Some(stop), Some(handle)) => Some((stop, handle)),
            _ => None,
        }
    }

    /// Bare ACK completing the three-way handshake.
    pub fn on_handshake_ack(&mut self) -> bool {
        if self.state == TcpFlowState::SynReceived {
            self.state = TcpFlowState::Established;
            trace!("flow {} established", self.key);
            true
        } else {
            false
        }
    }

    /// Device payload forwarded to the peer; acks reflect only what arrived
    /// contiguously (no reorder buffering, the device retransmits).
    pub fn on_client_payload(&mut self, len: usize) -> (u32, u32) {
        self.client_seq = self.client_seq.wrapping_add(len as u32);
        self.bytes_tx += len as u64;
        self.last_active = Instant::now();
        (self.server_seq, self.client_seq)
    }

    /// Peer payload about to be emitted toward the device. Returns the
    /// `(seq, ack)` to stamp on the segment, then advances `server_seq`.
    pub fn on_peer_payload(&mut self, len: usize) -> (u32, u32) {
        let numbers = (self.server_seq, self.client_seq);
        self.server_seq = self.server_seq.wrapping_add(len as u32);
        self.bytes_rx += len as u64;
        self.last_active = Instant::now();
        numbers
    }

    /// Device FIN at `seg_seq`. Returns `(fin_seq, fin_ack)` for the
    /// FIN+ACK we emit; our FIN consumes one sequence number.
    pub fn on_fin(&mut self, seg_seq: u32) -> (u32, u32) {
        self.client_seq = seg_seq.wrapping_add(1);
        let numbers = (self.server_seq, self.client_seq);
        self.server_seq = self.server_seq.wrapping_add(1);
        self.state = match self.state {
            TcpFlowState::Established | TcpFlowState::SynReceived => TcpFlowState::LastAck,
            other => other,
        };
        self.alive = false;
        numbers
    }

    /// We initiate close toward the device (peer EOF). Same sequence
    /// accounting as [`on_fin`] but the ack number is unchanged.
    pub fn on_peer_eof(&mut self) -> (u32, u32) {
        let numbers = (self.server_seq, self.client_seq);
        self.server_seq = self.server_seq.wrapping_add(1);
        self.state = TcpFlowState::LastAck;
        self.alive = false;
        numbers
    }

    /// ACK in LastAck finishes the close.
    pub fn on_last_ack(&mut self) -> bool {
        if self.state == TcpFlowState::LastAck {
            self.state = TcpFlowState::Closed;
            true
        } else {
            false
        }
    }

    /// RST from either side, or session failure: the flow is dead, no reply.
    pub fn on_reset(&mut self) {
        self.state = TcpFlowState::Closed;
        self.alive = false;
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.bytes_tx, self.bytes_rx)
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }
}

/// Concurrent table of live flows. Lookups and insert-if-absent are atomic.
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<RwLock<TcpFlow>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    /// Insert a flow unless the key is already present. Returns the winning
    /// entry and whether this call inserted it.
    pub fn insert_if_absent(&self, flow: TcpFlow) -> (Arc<RwLock<TcpFlow>>, bool) {
        let key = flow.key;
        match self.flows.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let flow = Arc::new(RwLock::new(flow));
                entry.insert(flow.clone());
                (flow, true)
            }
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<RwLock<TcpFlow>>> {
        self.flows.get(key).map(|entry| entry.clone())
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<RwLock<TcpFlow>>> {
        self.flows.remove(key).map(|(_, flow)| flow)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.flows.iter().map(|entry| *entry.key()).collect()
    }

    pub fn clear(&self) {
        self.flows.clear();
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slipstream_core::testing::MockRelay;

    async fn test_session() -> Arc<SecureSession> {
        let relay = MockRelay::spawn([0u8; 32], MockRelay::echo_behavior()).await;
        Arc::new(relay.dial().await.unwrap())
    }

    fn key(port: u16) -> FlowKey {
        FlowKey {
            src_port: port,
            dst_ip: Ipv4Addr::new(1, 2, 3, 4),
            dst_port: 80,
        }
    }

    #[tokio::test]
    async fn test_new_flow_sequence_setup() {
        let flow = TcpFlow::new(key(40000), test_session().await, Ipv4Addr::new(10, 0, 0, 2), 1000);
        assert_eq!(flow.state(), TcpFlowState::SynReceived);
        assert_eq!(flow.client_seq(), 1001);

        let (isn, ack) = flow.syn_ack_numbers();
        assert_eq!(ack, 1001);
        assert_eq!(flow.server_seq(), isn.wrapping_add(1));
    }

    #[tokio::test]
    async fn test_handshake_then_payload_advances_client_seq() {
        let mut flow =
            TcpFlow::new(key(40000), test_session().await, Ipv4Addr::new(10, 0, 0, 2), 1000);
        assert!(flow.on_handshake_ack());
        assert_eq!(flow.state(), TcpFlowState::Established);
        // Second ACK is a no-op.
        assert!(!flow.on_handshake_ack());

        let (seq, ack) = flow.on_client_payload(512);
        assert_eq!(seq, flow.server_seq());
        assert_eq!(ack, 1001 + 512);
    }

    #[tokio::test]
    async fn test_peer_payload_monotonic_server_seq() {
        let mut flow =
            TcpFlow::new(key(40000), test_session().await, Ipv4Addr::new(10, 0, 0, 2), 1000);
        flow.on_handshake_ack();
        let isn_plus_one = flow.server_seq();

        let (seq1, _) = flow.on_peer_payload(100);
        let (seq2, _) = flow.on_peer_payload(200);
        let (seq3, _) = flow.on_peer_payload(0);
        assert_eq!(seq1, isn_plus_one);
        assert_eq!(seq2, isn_plus_one.wrapping_add(100));
        assert_eq!(seq3, isn_plus_one.wrapping_add(300));
        assert_eq!(flow.stats().1, 300);
    }

    #[tokio::test]
    async fn test_fin_close_sequence() {
        let mut flow =
            TcpFlow::new(key(40000), test_session().await, Ipv4Addr::new(10, 0, 0, 2), 1000);
        flow.on_handshake_ack();

        let server_seq = flow.server_seq();
        let (fin_seq, fin_ack) = flow.on_fin(1001);
        assert_eq!(fin_seq, server_seq);
        assert_eq!(fin_ack, 1002);
        assert_eq!(flow.server_seq(), server_seq.wrapping_add(1));
        assert_eq!(flow.state(), TcpFlowState::LastAck);
        assert!(!flow.is_alive());

        assert!(flow.on_last_ack());
        assert_eq!(flow.state(), TcpFlowState::Closed);
    }

    #[tokio::test]
    async fn test_reset_closes_without_reply_numbers() {
        let mut flow =
            TcpFlow::new(key(40000), test_session().await, Ipv4Addr::new(10, 0, 0, 2), 1000);
        flow.on_reset();
        assert_eq!(flow.state(), TcpFlowState::Closed);
        assert!(!flow.is_alive());
    }

    #[tokio::test]
    async fn test_table_insert_if_absent_is_atomic() {
        let table = FlowTable::new();
        let session = test_session().await;
        let ip = Ipv4Addr::new(10, 0, 0, 2);

        let (first, inserted) =
            table.insert_if_absent(TcpFlow::new(key(40000), session.clone(), ip, 1000));
        assert!(inserted);
        let (second, inserted) =
            table.insert_if_absent(TcpFlow::new(key(40000), session.clone(), ip, 9999));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);

        // A different source port is a different flow.
        let (_, inserted) = table.insert_if_absent(TcpFlow::new(key(40001), session, ip, 5));
        assert!(inserted);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_table_remove() {
        let table = FlowTable::new();
        let session = test_session().await;
        let (_, _) = table.insert_if_absent(TcpFlow::new(
            key(40000),
            session,
            Ipv4Addr::new(10, 0, 0, 2),
            1,
        ));
        assert!(table.contains(&key(40000)));
        assert!(table.remove(&key(40000)).is_some());
        assert!(table.is_empty());
        assert!(table.remove(&key(40000)).is_none());
    }
}
