//! TUN device plumbing.
//!
//! The host hands over an already-configured packet file descriptor
//! (address, route, MTU and DNS are its concern). This wrapper turns the fd
//! into a pair of channels: a read task delivers raw IPv4 packets to the
//! engine, and a single write task drains reply packets so TUN writes are
//! never interleaved.

use crate::error::{NetStackError, Result};
use bytes::BytesMut;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use std::os::unix::io::RawFd;

/// Poll interval when the device has nothing to read.
const EMPTY_READ_SLEEP: Duration = Duration::from_millis(10);
/// Channel depth between the device and the engine.
const PACKET_CHANNEL: usize = 4096;

/// TUN parameters as provisioned by the host.
#[derive(Debug, Clone)]
pub struct TunConfig {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mtu: usize,
    pub dns: Vec<Ipv4Addr>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 0, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1500,
            dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
        }
    }
}

/// A TUN endpoint over a host-provided raw fd.
pub struct TunDevice {
    config: TunConfig,
    #[cfg(unix)]
    fd: RawFd,
    running: Arc<AtomicBool>,
    tx: Option<mpsc::Sender<BytesMut>>,
    rx: Option<mpsc::Receiver<BytesMut>>,
}

#[cfg(unix)]
impl TunDevice {
    /// Wrap a raw TUN fd. The fd is switched to non-blocking mode; ownership
    /// transfers to the device, which closes it on stop.
    pub fn from_raw_fd(fd: RawFd, config: TunConfig) -> Result<Self> {
        if fd < 0 {
            return Err(NetStackError::DeviceNotReady);
        }
        set_nonblocking(fd)?;
        Ok(Self {
            config,
            fd,
            running: Arc::new(AtomicBool::new(false)),
            tx: None,
            rx: None,
        })
    }

    pub fn config(&self) -> &TunConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Spawn the read and write tasks.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        info!("starting TUN device (fd {}, mtu {})", self.fd, self.config.mtu);

        let (tx_to_device, mut rx_from_engine) = mpsc::channel::<BytesMut>(PACKET_CHANNEL);
        let (tx_to_engine, rx_for_engine) = mpsc::channel::<BytesMut>(PACKET_CHANNEL);
        self.tx = Some(tx_to_device);
        self.rx = Some(rx_for_engine);
        self.running.store(true, Ordering::Relaxed);

        let fd = self.fd;
        let mtu = self.config.mtu;
        let running = self.running.clone();

        // Read loop: non-blocking reads of at most MTU bytes, short sleep
        // when the device is empty. Read errors are logged and retried.
        tokio::spawn(async move {
            let mut buf = vec![0u8; mtu];
            while running.load(Ordering::Relaxed) {
                match read_packet(fd, &mut buf) {
                    Ok(Some(n)) => {
                        if tx_to_engine.send(BytesMut::from(&buf[..n])).await.is_err() {
                            debug!("engine receiver dropped, TUN read task exiting");
                            break;
                        }
                    }
                    Ok(None) => tokio::time::sleep(EMPTY_READ_SLEEP).await,
                    Err(e) => {
                        warn!("TUN read error: {}", e);
                        tokio::time::sleep(EMPTY_READ_SLEEP).await;
                    }
                }
            }
            debug!("TUN read task stopped");
        });

        let running = self.running.clone();
        // Write loop: the single serialisation point for reply packets.
        // A write error aborts the engine by dropping the receiver.
        tokio::spawn(async move {
            while let Some(packet) = rx_from_engine.recv().await {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = write_packet(fd, &packet) {
                    error!("TUN write error, stopping: {}", e);
                    break;
                }
            }
            debug!("TUN write task stopped");
        });

        Ok(())
    }

    /// Sender for packets bound for the device (the engine's reply channel).
    pub fn sender(&self) -> Option<mpsc::Sender<BytesMut>> {
        self.tx.clone()
    }

    /// Take the receiver of packets read from the device.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<BytesMut>> {
        self.rx.take()
    }

    /// Stop the tasks and close the fd.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        info!("stopping TUN device");
        self.running.store(false, Ordering::Relaxed);
        self.tx = None;
        self.rx = None;
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(unix)]
impl Drop for TunDevice {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

#[cfg(unix)]
fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(NetStackError::Io(std::io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(NetStackError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// One non-blocking read. `Ok(None)` means nothing pending.
#[cfg(unix)]
fn read_packet(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        return Ok(Some(n as usize));
    }
    if n == 0 {
        return Ok(None);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(None)
    } else {
        Err(NetStackError::Io(err))
    }
}

#[cfg(unix)]
fn write_packet(fd: RawFd, packet: &[u8]) -> Result<()> {
    let n = unsafe { libc::write(fd, packet.as_ptr() as *const libc::c_void, packet.len()) };
    if n < 0 {
        return Err(NetStackError::Io(std::io::Error::last_os_error()));
    }
    if (n as usize) != packet.len() {
        return Err(NetStackError::InvalidPacket(format!(
            "short TUN write: {} of {}",
            n,
            packet.len()
        )));
    }
    Ok(())
}
