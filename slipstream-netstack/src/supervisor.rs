//! Lifecycle supervisor.
//!
//! Owns the pool, the TUN device and the engine, and is the only component
//! that starts or stops them. Bring-up order is pool, TUN, engine; teardown
//! runs in reverse. Host-side permission revocation arrives as an external
//! signal and triggers the same teardown.

use crate::dns::DnsResponder;
use crate::engine::PacketEngine;
use crate::error::{NetStackError, Result};
use crate::tun::{TunConfig, TunDevice};
use slipstream_core::{ProxyConfig, RelayConnector, SessionConnector, SessionPool};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use std::os::unix::io::RawFd;

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Signals the supervisor that the host revoked the VPN permission.
#[derive(Clone)]
pub struct RevokeHandle {
    tx: mpsc::Sender<()>,
}

impl RevokeHandle {
    pub fn revoke(&self) {
        let _ = self.tx.try_send(());
    }
}

struct EngineRuntime {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<Result<()>>,
}

/// Top-level holder of the proxy core. Explicitly constructed and passed
/// around; there is no process-wide instance.
pub struct Supervisor {
    config: ProxyConfig,
    tun_config: TunConfig,
    pool: Arc<SessionPool>,
    state_tx: watch::Sender<SupervisorState>,
    state_rx: watch::Receiver<SupervisorState>,
    engine: Option<Arc<PacketEngine>>,
    runtime: Option<EngineRuntime>,
    tun: Option<TunDevice>,
    revoke_tx: mpsc::Sender<()>,
    revoke_rx: mpsc::Receiver<()>,
}

impl Supervisor {
    pub fn new(config: ProxyConfig) -> Self {
        let connector: Arc<dyn SessionConnector> = Arc::new(RelayConnector::new(config.clone()));
        Self::with_connector(config, connector)
    }

    /// Construction seam for tests: any session source will do.
    pub fn with_connector(config: ProxyConfig, connector: Arc<dyn SessionConnector>) -> Self {
        let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);
        let (revoke_tx, revoke_rx) = mpsc::channel(1);
        Self {
            config,
            tun_config: TunConfig::default(),
            pool: Arc::new(SessionPool::new(connector)),
            state_tx,
            state_rx,
            engine: None,
            runtime: None,
            tun: None,
            revoke_tx,
            revoke_rx,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    /// Read-only lifecycle channel for the host layer.
    pub fn status(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Handle the host uses to signal permission revocation.
    pub fn revoke_handle(&self) -> RevokeHandle {
        RevokeHandle {
            tx: self.revoke_tx.clone(),
        }
    }

    /// Engine counters, while the engine is up.
    pub fn engine_stats(&self) -> Option<Arc<crate::engine::EngineStats>> {
        self.engine.as_ref().map(|engine| engine.stats())
    }

    fn transition(&self, next: SupervisorState) {
        info!("supervisor {:?} -> {:?}", self.state(), next);
        let _ = self.state_tx.send(next);
    }

    /// Bring the core up on the given TUN fd: warm the pool, start the
    /// device, spawn the engine.
    pub async fn start(&mut self, tun_fd: RawFd) -> Result<()> {
        match self.state() {
            SupervisorState::Idle | SupervisorState::Stopped => {}
            other => {
                warn!("start requested in state {:?}", other);
                return Err(NetStackError::Flow(format!(
                    "cannot start from {:?}",
                    other
                )));
            }
        }
        self.transition(SupervisorState::Starting);

        let warmed = self.pool.init().await;
        if warmed == 0 {
            warn!("pool warm-up produced no sessions; flows will connect lazily");
        }

        let mut tun = match TunDevice::from_raw_fd(tun_fd, self.tun_config.clone()) {
            Ok(tun) => tun,
            Err(e) => {
                self.transition(SupervisorState::Error);
                return Err(e);
            }
        };
        if let Err(e) = tun.start() {
            self.transition(SupervisorState::Error);
            return Err(e);
        }

        let tun_tx = tun.sender().ok_or(NetStackError::DeviceNotReady)?;
        let tun_rx = tun.take_receiver().ok_or(NetStackError::DeviceNotReady)?;

        let engine = PacketEngine::new(
            self.pool.clone(),
            DnsResponder::new(self.config.primary_dns()),
            tun_tx,
        );
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(engine.clone().run(tun_rx, shutdown_rx));

        self.engine = Some(engine);
        self.runtime = Some(EngineRuntime { shutdown_tx, join });
        self.tun = Some(tun);
        self.transition(SupervisorState::Running);
        Ok(())
    }

    /// Tear everything down in reverse bring-up order.
    pub async fn stop(&mut self) {
        match self.state() {
            SupervisorState::Running | SupervisorState::Error => {}
            SupervisorState::Starting => {}
            other => {
                warn!("stop requested in state {:?}", other);
                return;
            }
        }
        self.transition(SupervisorState::Stopping);

        if let Some(runtime) = self.runtime.take() {
            let _ = runtime.shutdown_tx.send(()).await;
            match runtime.join.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("engine exited with error: {}", e),
                Err(e) => warn!("engine task join failed: {}", e),
            }
        }
        self.engine = None;

        self.pool.cleanup().await;

        if let Some(mut tun) = self.tun.take() {
            tun.stop();
        }

        self.transition(SupervisorState::Stopped);
    }

    /// Run until the engine dies or the host revokes permission, then stop.
    pub async fn run(&mut self, tun_fd: RawFd) -> Result<()> {
        self.start(tun_fd).await?;

        let mut engine_result = None;
        {
            let runtime = self.runtime.as_mut().expect("running without runtime");
            tokio::select! {
                _ = self.revoke_rx.recv() => {
                    info!("permission revoked by host");
                }
                result = &mut runtime.join => {
                    engine_result = Some(result);
                }
            }
        }

        // If the engine task finished, its handle must not be joined again
        // during stop().
        let engine_failed = match engine_result {
            None => false,
            Some(result) => {
                self.runtime = None;
                match result {
                    Ok(Ok(())) => false,
                    Ok(Err(e)) => {
                        error!("engine failed: {}", e);
                        true
                    }
                    Err(e) => {
                        error!("engine task panicked: {}", e);
                        true
                    }
                }
            }
        };

        if engine_failed {
            self.transition(SupervisorState::Error);
        }
        self.stop().await;

        if engine_failed {
            Err(NetStackError::EngineStopped)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use slipstream_core::testing::MockRelay;
    use slipstream_core::{Result as CoreResult, SecureSession};
    use std::net::Ipv4Addr;

    struct MockConnector {
        relay: MockRelay,
    }

    #[async_trait]
    impl SessionConnector for MockConnector {
        async fn connect(&self) -> CoreResult<SecureSession> {
            self.relay.dial().await
        }
    }

    fn test_config() -> ProxyConfig {
        slipstream_core::ConfigFile {
            sni_host: "cdn.example.com".to_string(),
            relay_address: "127.0.0.1".to_string(),
            relay_port: 443,
            ws_path: "/tunnel".to_string(),
            psk: "00".repeat(32),
            verify_certificates: false,
            upstream_dns: vec![Ipv4Addr::new(8, 8, 8, 8)],
            log_level: "info".to_string(),
        }
        .into_proxy_config()
        .unwrap()
    }

    fn tun_fd_pair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    async fn mock_supervisor() -> Supervisor {
        let relay = MockRelay::spawn([0u8; 32], MockRelay::echo_behavior()).await;
        Supervisor::with_connector(test_config(), Arc::new(MockConnector { relay }))
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (device_fd, host_fd) = tun_fd_pair();
        let mut supervisor = mock_supervisor().await;
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        supervisor.start(device_fd).await.unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Running);

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        unsafe { libc::close(host_fd) };
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let (device_fd, host_fd) = tun_fd_pair();
        let mut supervisor = mock_supervisor().await;
        supervisor.start(device_fd).await.unwrap();
        assert!(supervisor.start(device_fd).await.is_err());
        supervisor.stop().await;
        unsafe { libc::close(host_fd) };
    }

    #[tokio::test]
    async fn test_revoke_stops_run() {
        let (device_fd, host_fd) = tun_fd_pair();
        let mut supervisor = mock_supervisor().await;
        let revoke = supervisor.revoke_handle();
        let mut status = supervisor.status();

        let driver = async move {
            supervisor.run(device_fd).await.unwrap();
            supervisor
        };
        tokio::pin!(driver);

        // Wait for Running, then pull the plug.
        tokio::select! {
            _ = &mut driver => panic!("run returned before revoke"),
            _ = async {
                loop {
                    status.changed().await.unwrap();
                    if *status.borrow() == SupervisorState::Running {
                        break;
                    }
                }
            } => {}
        }
        revoke.revoke();

        let supervisor = driver.await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        unsafe { libc::close(host_fd) };
    }

    #[tokio::test]
    async fn test_status_channel_reports_transitions() {
        let (device_fd, host_fd) = tun_fd_pair();
        let mut supervisor = mock_supervisor().await;
        let status = supervisor.status();

        supervisor.start(device_fd).await.unwrap();
        assert_eq!(*status.borrow(), SupervisorState::Running);
        supervisor.stop().await;
        assert_eq!(*status.borrow(), SupervisorState::Stopped);
        unsafe { libc::close(host_fd) };
    }
}
