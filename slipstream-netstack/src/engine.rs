//! The packet engine: TUN on one side, pooled relay sessions on the other.
//!
//! The read loop parses each TUN packet, drives the per-flow TCP state
//! machine and forwards payload through the flow's relay session. One
//! background task per flow carries peer bytes back into the TUN; every
//! reply packet goes through the single TUN writer channel so writes are
//! never interleaved.

use crate::dns::DnsResponder;
use crate::error::{NetStackError, Result};
use crate::flow::{FlowKey, FlowTable, TcpFlow, TcpFlowState};
use crate::packet::{
    build_ipv4_tcp, parse_packet, TcpFlags, TcpSegment, Transport, MAX_TCP_PAYLOAD,
};
use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::RwLock;
use slipstream_core::{SecureSession, SessionPool};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Deadline for acquiring a session and completing the relay CONNECT.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub dns_queries: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub bytes_downloaded: AtomicU64,
}

impl EngineStats {
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }
    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }
    pub fn dns_queries(&self) -> u64 {
        self.dns_queries.load(Ordering::Relaxed)
    }
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }
}

/// The packet engine. Owns the flow table; reply packets go out through the
/// serialised TUN writer channel.
pub struct PacketEngine {
    pool: Arc<SessionPool>,
    flows: Arc<FlowTable>,
    dns: Arc<DnsResponder>,
    tun_tx: mpsc::Sender<BytesMut>,
    stats: Arc<EngineStats>,
    running: Arc<AtomicBool>,
    /// Keys with a CONNECT in flight, so retransmitted SYNs don't spawn a
    /// second attempt.
    pending: DashMap<FlowKey, ()>,
}

impl PacketEngine {
    pub fn new(
        pool: Arc<SessionPool>,
        dns: DnsResponder,
        tun_tx: mpsc::Sender<BytesMut>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            flows: Arc::new(FlowTable::new()),
            dns: Arc::new(dns),
            tun_tx,
            stats: Arc::new(EngineStats::default()),
            running: Arc::new(AtomicBool::new(false)),
            pending: DashMap::new(),
        })
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Main loop: dispatch TUN packets until shutdown or the TUN writer
    /// disappears.
    pub async fn run(
        self: Arc<Self>,
        mut tun_rx: mpsc::Receiver<BytesMut>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        self.running.store(true, Ordering::Relaxed);
        info!("packet engine started");

        let result = loop {
            tokio::select! {
                maybe_packet = tun_rx.recv() => match maybe_packet {
                    Some(pkt) => {
                        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
                        match self.process_packet(&pkt).await {
                            Ok(()) => {}
                            // A dead TUN writer is fatal to the engine.
                            Err(NetStackError::ChannelClosed) => {
                                warn!("TUN writer gone, stopping engine");
                                break Err(NetStackError::ChannelClosed);
                            }
                            Err(e) => {
                                trace!("packet dropped: {}", e);
                                self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    None => {
                        debug!("TUN read channel closed");
                        break Ok(());
                    }
                },
                _ = shutdown_rx.recv() => {
                    debug!("engine shutdown requested");
                    break Ok(());
                }
            }
        };

        self.shutdown_flows().await;
        self.running.store(false, Ordering::Relaxed);
        info!("packet engine stopped");
        result
    }

    /// Parse and dispatch one TUN packet.
    pub async fn process_packet(self: &Arc<Self>, pkt: &[u8]) -> Result<()> {
        let parsed = match parse_packet(pkt) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Non-IPv4 and malformed input is dropped silently.
                trace!("unparseable packet: {}", e);
                return Ok(());
            }
        };

        match parsed.transport {
            Transport::Tcp(segment) => {
                self.stats.tcp_packets.fetch_add(1, Ordering::Relaxed);
                self.handle_tcp(parsed.src_addr, parsed.dst_addr, segment).await
            }
            Transport::Udp(datagram) => {
                self.stats.udp_packets.fetch_add(1, Ordering::Relaxed);
                if datagram.dst_port == 53 {
                    self.stats.dns_queries.fetch_add(1, Ordering::Relaxed);
                    let dns = self.dns.clone();
                    let tun_tx = self.tun_tx.clone();
                    let src = (parsed.src_addr, datagram.src_port);
                    let dst = (parsed.dst_addr, datagram.dst_port);
                    let payload = datagram.payload.to_vec();
                    tokio::spawn(async move {
                        if let Err(e) = dns.handle_query(src, dst, &payload, tun_tx).await {
                            debug!("dns query dropped: {}", e);
                        }
                    });
                } else {
                    trace!("non-DNS UDP to :{} dropped", datagram.dst_port);
                }
                Ok(())
            }
            Transport::Icmp => {
                debug!("ICMP packet dropped (not forwarded)");
                Ok(())
            }
            Transport::Other(proto) => {
                debug!("protocol {} dropped", proto);
                Ok(())
            }
        }
    }

    async fn handle_tcp(
        self: &Arc<Self>,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        segment: TcpSegment<'_>,
    ) -> Result<()> {
        let key = FlowKey {
            src_port: segment.src_port,
            dst_ip,
            dst_port: segment.dst_port,
        };

        if segment.flags.syn && !segment.flags.ack {
            if self.flows.contains(&key) || self.pending.insert(key, ()).is_some() {
                trace!("duplicate SYN for {}", key);
                return Ok(());
            }
            debug!("SYN for {}", key);
            let engine = self.clone();
            let client_isn = segment.seq;
            tokio::spawn(async move {
                engine.open_flow(key, src_ip, client_isn).await;
                engine.pending.remove(&key);
            });
            return Ok(());
        }

        let Some(flow) = self.flows.get(&key) else {
            if !segment.flags.rst {
                trace!("segment for unknown flow {}, sending RST", key);
                self.send_tcp(
                    &key,
                    src_ip,
                    segment.ack,
                    segment.seq.wrapping_add(1),
                    TcpFlags::rst_ack(),
                    &[],
                )
                .await?;
            }
            return Ok(());
        };

        if segment.flags.rst {
            debug!("RST from device for {}", key);
            flow.write().on_reset();
            self.teardown_flow(&key).await;
            return Ok(());
        }

        if segment.flags.fin {
            let (fin_seq, fin_ack) = flow.write().on_fin(segment.seq);
            self.send_tcp(&key, src_ip, fin_seq, fin_ack, TcpFlags::ack_only(), &[])
                .await?;
            self.send_tcp(&key, src_ip, fin_seq, fin_ack, TcpFlags::fin_ack(), &[])
                .await?;
            self.detach_and_release(&flow).await;
            return Ok(());
        }

        if segment.payload.is_empty() {
            if segment.flags.ack {
                let mut guard = flow.write();
                match guard.state() {
                    TcpFlowState::SynReceived => {
                        guard.on_handshake_ack();
                    }
                    TcpFlowState::LastAck => {
                        guard.on_last_ack();
                        drop(guard);
                        self.flows.remove(&key);
                    }
                    _ => {}
                }
            }
            return Ok(());
        }

        // Data segment.
        let established = {
            let mut guard = flow.write();
            if guard.state() == TcpFlowState::SynReceived && segment.flags.ack {
                guard.on_handshake_ack();
            }
            guard.state() == TcpFlowState::Established
        };
        if !established {
            trace!("payload for {} before Established, dropped", key);
            return Ok(());
        }

        let session = flow.read().session();
        match session.send(segment.payload).await {
            Ok(()) => {
                let (seq, ack) = flow.write().on_client_payload(segment.payload.len());
                self.stats
                    .bytes_uploaded
                    .fetch_add(segment.payload.len() as u64, Ordering::Relaxed);
                self.send_tcp(&key, src_ip, seq, ack, TcpFlags::ack_only(), &[])
                    .await
            }
            Err(e) => {
                warn!("session send failed for {}: {}", key, e);
                let (seq, ack) = {
                    let guard = flow.read();
                    (guard.server_seq(), guard.client_seq())
                };
                flow.write().on_reset();
                self.send_tcp(&key, src_ip, seq, ack, TcpFlags::rst_ack(), &[])
                    .await?;
                self.teardown_flow(&key).await;
                Ok(())
            }
        }
    }

    /// SYN path: acquire a session, CONNECT through the relay, then answer
    /// the device with a SYN-ACK and start the peer->device forwarder.
    async fn open_flow(self: &Arc<Self>, key: FlowKey, src_ip: Ipv4Addr, client_isn: u32) {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, async {
            let session = self.pool.acquire().await?;
            match session
                .send_connect(&key.dst_ip.to_string(), key.dst_port)
                .await
            {
                Ok(()) => Ok(session),
                Err(e) => {
                    self.pool.release(session).await;
                    Err(e)
                }
            }
        })
        .await;

        let session = match connect {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!("CONNECT for {} refused: {}", key, e);
                let _ = self
                    .send_tcp(
                        &key,
                        src_ip,
                        0,
                        client_isn.wrapping_add(1),
                        TcpFlags::rst_ack(),
                        &[],
                    )
                    .await;
                return;
            }
            Err(_) => {
                warn!("CONNECT for {} timed out", key);
                let _ = self
                    .send_tcp(
                        &key,
                        src_ip,
                        0,
                        client_isn.wrapping_add(1),
                        TcpFlags::rst_ack(),
                        &[],
                    )
                    .await;
                return;
            }
        };

        let mut flow = TcpFlow::new(key, session.clone(), src_ip, client_isn);
        let (syn_seq, syn_ack) = flow.syn_ack_numbers();

        // Attach the forwarder before the flow becomes visible, so teardown
        // always finds it.
        let (stop_tx, stop_rx) = oneshot::channel();
        let engine = self.clone();
        let forwarder_session = session.clone();
        let handle = tokio::spawn(async move {
            engine
                .forwarder_loop(key, src_ip, forwarder_session, stop_rx)
                .await;
        });
        flow.set_forwarder(stop_tx, handle);

        let (_entry, inserted) = self.flows.insert_if_absent(flow);
        if !inserted {
            // Lost a race with another SYN task. Dropping the losing flow
            // drops its stop handle, which ends the forwarder.
            self.pool.release(session).await;
            return;
        }

        if self
            .send_tcp(&key, src_ip, syn_seq, syn_ack, TcpFlags::syn_ack(), &[])
            .await
            .is_err()
        {
            self.teardown_flow(&key).await;
            return;
        }
        debug!("flow {} connected, SYN-ACK sent", key);
    }

    /// Peer->device forwarder. Holds only the flow key and looks the flow up
    /// per delivery, so the flow table stays the sole owner.
    async fn forwarder_loop(
        self: Arc<Self>,
        key: FlowKey,
        device_ip: Ipv4Addr,
        session: Arc<SecureSession>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        loop {
            let data = tokio::select! {
                _ = &mut stop_rx => return,
                result = session.recv() => match result {
                    Ok(data) => data,
                    Err(e) => {
                        debug!("session recv for {} failed: {}", key, e);
                        self.flow_failed(&key).await;
                        return;
                    }
                }
            };

            if data.is_empty() {
                debug!("peer EOF for {}", key);
                self.peer_eof(&key, device_ip).await;
                return;
            }

            // Payload delivered before the device's handshake ACK waits here;
            // nothing is emitted toward the device until Established. A brief
            // grace period covers the window before the flow is in the table.
            let mut waited = Duration::ZERO;
            loop {
                match self.flows.get(&key).map(|flow| flow.read().state()) {
                    Some(TcpFlowState::Established) => break,
                    Some(TcpFlowState::SynReceived) | None if waited < Duration::from_secs(1) => {
                        waited += Duration::from_millis(10);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    _ => return,
                }
            }

            let Some(flow) = self.flows.get(&key) else {
                return;
            };
            let (mut seq, ack) = flow.write().on_peer_payload(data.len());
            drop(flow);
            self.stats
                .bytes_downloaded
                .fetch_add(data.len() as u64, Ordering::Relaxed);

            for chunk in data.chunks(MAX_TCP_PAYLOAD) {
                if self
                    .send_tcp(&key, device_ip, seq, ack, TcpFlags::psh_ack(), chunk)
                    .await
                    .is_err()
                {
                    return;
                }
                seq = seq.wrapping_add(chunk.len() as u32);
            }
        }
    }

    /// Session died under the flow: RST toward the device, drop everything.
    async fn flow_failed(&self, key: &FlowKey) {
        if let Some(flow) = self.flows.remove(key) {
            let (seq, ack, device_ip) = {
                let guard = flow.read();
                (guard.server_seq(), guard.client_seq(), guard.src_ip())
            };
            let session = {
                let mut guard = flow.write();
                guard.on_reset();
                guard.take_session_for_release()
            };
            let _ = self
                .send_tcp(key, device_ip, seq, ack, TcpFlags::rst_ack(), &[])
                .await;
            if let Some(session) = session {
                // The dead session will not pass the pool health check.
                self.pool.release(session).await;
            }
        }
    }

    /// Peer closed its half: FIN+ACK toward the device, then wait in LastAck
    /// for the final device ACK.
    async fn peer_eof(&self, key: &FlowKey, device_ip: Ipv4Addr) {
        let Some(flow) = self.flows.get(key) else {
            return;
        };
        let (numbers, session) = {
            let mut guard = flow.write();
            (guard.on_peer_eof(), guard.take_session_for_release())
        };
        drop(flow);
        let _ = self
            .send_tcp(key, device_ip, numbers.0, numbers.1, TcpFlags::fin_ack(), &[])
            .await;
        if let Some(session) = session {
            self.pool.release(session).await;
        }
    }

    /// Stop the forwarder and hand the session back to the pool.
    async fn detach_and_release(&self, flow: &Arc<RwLock<TcpFlow>>) {
        let (forwarder, session) = {
            let mut guard = flow.write();
            (guard.take_forwarder(), guard.take_session_for_release())
        };
        if let Some((stop, handle)) = forwarder {
            let _ = stop.send(());
            let _ = handle.await;
        }
        if let Some(session) = session {
            self.pool.release(session).await;
        }
    }

    /// Remove a flow and release its resources.
    async fn teardown_flow(&self, key: &FlowKey) {
        if let Some(flow) = self.flows.remove(key) {
            self.detach_and_release(&flow).await;
        }
    }

    /// Drain every flow on engine shutdown.
    async fn shutdown_flows(&self) {
        let keys = self.flows.keys();
        if !keys.is_empty() {
            info!("closing {} flows", keys.len());
        }
        for key in keys {
            self.teardown_flow(&key).await;
        }
    }

    /// Build and emit one reply segment toward the device. The source is the
    /// flow's peer endpoint, the destination the device endpoint.
    async fn send_tcp(
        &self,
        key: &FlowKey,
        device_ip: Ipv4Addr,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Result<()> {
        let pkt = build_ipv4_tcp(
            key.dst_ip,
            device_ip,
            key.dst_port,
            key.src_port,
            seq,
            ack,
            flags,
            payload,
        );
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.tun_tx
            .send(BytesMut::from(&pkt[..]))
            .await
            .map_err(|_| NetStackError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use slipstream_core::testing::{MockRelay, RelayBehavior};
    use slipstream_core::{Result as CoreResult, SessionConnector};

    const DEVICE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const PEER: Ipv4Addr = Ipv4Addr::new(1, 2, 3, 4);

    struct MockConnector {
        relay: MockRelay,
    }

    #[async_trait]
    impl SessionConnector for MockConnector {
        async fn connect(&self) -> CoreResult<SecureSession> {
            self.relay.dial().await
        }
    }

    struct Harness {
        engine: Arc<PacketEngine>,
        tun_in: mpsc::Sender<BytesMut>,
        tun_out: mpsc::Receiver<BytesMut>,
        _shutdown: mpsc::Sender<()>,
    }

    async fn harness(behavior: RelayBehavior) -> Harness {
        let relay = MockRelay::spawn([0u8; 32], behavior).await;
        let pool = Arc::new(SessionPool::with_capacity(
            Arc::new(MockConnector { relay }),
            5,
        ));
        let (tun_in, tun_in_rx) = mpsc::channel(64);
        let (tun_out_tx, tun_out) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let engine = PacketEngine::new(
            pool,
            DnsResponder::new(Ipv4Addr::new(8, 8, 8, 8)),
            tun_out_tx,
        );
        tokio::spawn(engine.clone().run(tun_in_rx, shutdown_rx));

        Harness {
            engine,
            tun_in,
            tun_out,
            _shutdown: shutdown_tx,
        }
    }

    fn device_tcp(src_port: u16, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> BytesMut {
        let pkt = build_ipv4_tcp(DEVICE, PEER, src_port, 80, seq, ack, flags, payload);
        BytesMut::from(&pkt[..])
    }

    /// Next emitted TCP segment as (flags, seq, ack, payload).
    async fn next_segment(tun_out: &mut mpsc::Receiver<BytesMut>) -> (TcpFlags, u32, u32, Vec<u8>) {
        let pkt = tokio::time::timeout(Duration::from_secs(5), tun_out.recv())
            .await
            .expect("timed out waiting for reply packet")
            .expect("tun channel closed");
        let parsed = parse_packet(&pkt).unwrap();
        assert_eq!(parsed.src_addr, PEER);
        assert_eq!(parsed.dst_addr, DEVICE);
        match parsed.transport {
            Transport::Tcp(seg) => (seg.flags, seg.seq, seg.ack, seg.payload.to_vec()),
            other => panic!("expected TCP reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_three_way_handshake() {
        let mut h = harness(MockRelay::connect_behavior(0x00)).await;

        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        h.tun_in.send(device_tcp(40000, 1000, 0, syn, &[])).await.unwrap();

        let (flags, isn, ack, payload) = next_segment(&mut h.tun_out).await;
        assert!(flags.syn && flags.ack);
        assert_eq!(ack, 1001);
        assert!(payload.is_empty());
        assert_eq!(h.engine.flow_count(), 1);

        // Bare ACK completes the handshake.
        h.tun_in
            .send(device_tcp(40000, 1001, isn.wrapping_add(1), TcpFlags::ack_only(), &[]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.flow_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_resets_device() {
        let mut h = harness(MockRelay::connect_behavior(0x02)).await;

        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        h.tun_in.send(device_tcp(40000, 1000, 0, syn, &[])).await.unwrap();

        let (flags, _seq, ack, _) = next_segment(&mut h.tun_out).await;
        assert!(flags.rst);
        assert_eq!(ack, 1001);
        assert_eq!(h.engine.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_bidirectional_data() {
        let mut h = harness(MockRelay::connect_behavior(0x00)).await;

        // Handshake.
        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        h.tun_in.send(device_tcp(40000, 1000, 0, syn, &[])).await.unwrap();
        let (_, isn, _, _) = next_segment(&mut h.tun_out).await;
        h.tun_in
            .send(device_tcp(40000, 1001, isn.wrapping_add(1), TcpFlags::ack_only(), &[]))
            .await
            .unwrap();

        // Device sends 512 bytes; the mock relay echoes them back.
        let payload: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
        h.tun_in
            .send(device_tcp(40000, 1001, isn.wrapping_add(1), TcpFlags::psh_ack(), &payload))
            .await
            .unwrap();

        // Expect an ACK covering the payload and PSH+ACK segments carrying
        // the echo, in either order.
        let mut saw_ack = false;
        let mut echoed = Vec::new();
        let mut seqs = Vec::new();
        while !(saw_ack && echoed.len() >= 512) {
            let (flags, seq, ack, data) = next_segment(&mut h.tun_out).await;
            if data.is_empty() {
                assert!(flags.ack && !flags.psh);
                assert_eq!(ack, 1001 + 512);
                saw_ack = true;
            } else {
                assert!(flags.psh && flags.ack);
                assert_eq!(ack, 1001 + 512);
                seqs.push(seq);
                echoed.extend_from_slice(&data);
            }
        }
        assert_eq!(echoed, payload);
        assert_eq!(seqs[0], isn.wrapping_add(1));
        assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seq must advance");
    }

    #[tokio::test]
    async fn test_fin_teardown() {
        let mut h = harness(MockRelay::connect_behavior(0x00)).await;

        let syn = TcpFlags {
            syn: true,
            ..Default::default()
        };
        h.tun_in.send(device_tcp(40000, 1000, 0, syn, &[])).await.unwrap();
        let (_, isn, _, _) = next_segment(&mut h.tun_out).await;
        h.tun_in
            .send(device_tcp(40000, 1001, isn.wrapping_add(1), TcpFlags::ack_only(), &[]))
            .await
            .unwrap();

        h.tun_in
            .send(device_tcp(40000, 1001, isn.wrapping_add(1), TcpFlags::fin_ack(), &[]))
            .await
            .unwrap();

        // ACK then FIN+ACK, both acknowledging the FIN.
        let (flags, _, ack, _) = next_segment(&mut h.tun_out).await;
        assert!(flags.ack && !flags.fin);
        assert_eq!(ack, 1002);
        let (flags, _, ack, _) = next_segment(&mut h.tun_out).await;
        assert!(flags.fin && flags.ack);
        assert_eq!(ack, 1002);

        // Final device ACK removes the flow.
        h.tun_in
            .send(device_tcp(40000, 1002, isn.wrapping_add(2), TcpFlags::ack_only(), &[]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_flow_gets_rst() {
        let mut h = harness(MockRelay::connect_behavior(0x00)).await;

        h.tun_in
            .send(device_tcp(41000, 5000, 7777, TcpFlags::ack_only(), &[]))
            .await
            .unwrap();

        let (flags, seq, ack, _) = next_segment(&mut h.tun_out).await;
        assert!(flags.rst);
        assert_eq!(seq, 7777);
        assert_eq!(ack, 5001);
    }

    #[tokio::test]
    async fn test_rst_from_device_is_silent() {
        let mut h = harness(MockRelay::connect_behavior(0x00)).await;

        let rst = TcpFlags {
            rst: true,
            ..Default::default()
        };
        h.tun_in.send(device_tcp(42000, 1, 0, rst, &[])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.tun_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_dns_udp_dropped() {
        let mut h = harness(MockRelay::connect_behavior(0x00)).await;

        let pkt = crate::packet::build_ipv4_udp(DEVICE, PEER, 40000, 9999, b"not dns");
        h.tun_in.send(BytesMut::from(&pkt[..])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.tun_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_ipv4_dropped_silently() {
        let mut h = harness(MockRelay::connect_behavior(0x00)).await;

        let mut v6 = vec![0u8; 60];
        v6[0] = 0x60;
        h.tun_in.send(BytesMut::from(&v6[..])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.tun_out.try_recv().is_err());
        assert_eq!(h.engine.stats().packets_received(), 1);
    }
}
