use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::stats::PacketLossSimulation;

/// The datagram channel a registry runs on.
pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Waits up to `timeout` (forever when `None`) for one datagram.
    /// `Ok(None)` means the wait timed out.
    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> SocketAddr;
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        let local_addr = socket.local_addr()?;
        Ok(Self { socket, local_addr })
    }
}

impl DatagramSocket for UdpTransport {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        // a zero read timeout is rejected by the OS
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.socket.set_read_timeout(timeout)?;

        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            // ICMP port unreachable from an earlier send surfaces here on some platforms
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                log::debug!(target: "tether::socket", "Ignoring connection reset on {}", self.local_addr);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type Datagram = (Vec<u8>, SocketAddr);

#[derive(Debug, Default)]
struct Faults {
    drop_next: usize,
    duplicate_next: usize,
    hold_next: usize,
    held: Vec<Datagram>,
}

#[derive(Debug, Default)]
struct MemoryNetworkState {
    endpoints: HashMap<SocketAddr, Sender<Datagram>>,
    faults: HashMap<SocketAddr, Faults>,
}

/// In-process datagram network. Sends to unbound addresses vanish, as they
/// would over UDP.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<MemoryNetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemorySocket> {
        let mut state = self.lock()?;
        if state.endpoints.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already bound", addr),
            ));
        }

        let (sender, receiver) = mpsc::channel();
        state.endpoints.insert(addr, sender);

        Ok(MemorySocket {
            addr,
            network: self.clone(),
            receiver: Mutex::new(receiver),
        })
    }

    /// Silently discards the next `count` datagrams addressed to `to`.
    pub fn drop_next(&self, to: SocketAddr, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.faults.entry(to).or_default().drop_next += count;
        }
    }

    /// Delivers the next `count` datagrams addressed to `to` twice.
    pub fn duplicate_next(&self, to: SocketAddr, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.faults.entry(to).or_default().duplicate_next += count;
        }
    }

    /// Holds back the next `count` datagrams addressed to `to` until
    /// [`release_held`](Self::release_held), so later sends overtake them.
    pub fn hold_next(&self, to: SocketAddr, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.faults.entry(to).or_default().hold_next += count;
        }
    }

    /// Delivers everything held for `to`, in the order it was sent.
    pub fn release_held(&self, to: SocketAddr) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let held = match state.faults.get_mut(&to) {
            Some(faults) => std::mem::take(&mut faults.held),
            None => return 0,
        };
        let released = held.len();
        if let Some(sender) = state.endpoints.get(&to) {
            for datagram in held {
                let _ = sender.send(datagram);
            }
        }
        released
    }

    fn deliver(&self, data: &[u8], from: SocketAddr, to: SocketAddr) -> io::Result<usize> {
        let mut state = self.lock()?;

        let mut copies = 1;
        if let Some(faults) = state.faults.get_mut(&to) {
            if faults.drop_next > 0 {
                faults.drop_next -= 1;
                return Ok(data.len());
            }
            if faults.hold_next > 0 {
                faults.hold_next -= 1;
                faults.held.push((data.to_vec(), from));
                return Ok(data.len());
            }
            if faults.duplicate_next > 0 {
                faults.duplicate_next -= 1;
                copies = 2;
            }
        }

        if let Some(sender) = state.endpoints.get(&to) {
            for _ in 0..copies {
                let _ = sender.send((data.to_vec(), from));
            }
        }
        Ok(data.len())
    }

    fn unbind(&self, addr: &SocketAddr) {
        if let Ok(mut state) = self.lock() {
            state.endpoints.remove(addr);
            state.faults.remove(addr);
        }
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, MemoryNetworkState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("memory network lock poisoned"))
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    receiver: Mutex<Receiver<Datagram>>,
}

impl DatagramSocket for MemorySocket {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.network.deliver(data, self.addr, addr)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| io::Error::other("memory socket lock poisoned"))?;

        let received = match timeout {
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(datagram) => datagram,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
            },
            None => receiver
                .recv()
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?,
        };

        let (data, from) = received;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Some((len, from)))
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.unbind(&self.addr);
    }
}

/// Applies a [`PacketLossSimulation`] to everything sent through `inner`.
pub struct LossySocket<S> {
    inner: S,
    simulation: Mutex<PacketLossSimulation>,
}

impl<S: DatagramSocket> LossySocket<S> {
    pub fn new(inner: S, simulation: PacketLossSimulation) -> Self {
        Self {
            inner,
            simulation: Mutex::new(simulation),
        }
    }

    pub fn set_simulation(&self, simulation: PacketLossSimulation) {
        if let Ok(mut current) = self.simulation.lock() {
            *current = simulation;
        }
    }

    fn simulation(&self) -> PacketLossSimulation {
        self.simulation
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

impl<S: DatagramSocket> DatagramSocket for LossySocket<S> {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        let simulation = self.simulation();
        if simulation.should_drop() {
            log::trace!(target: "tether::socket", "Simulated loss of {} bytes to {}", data.len(), addr);
            return Ok(data.len());
        }
        if simulation.should_duplicate() {
            self.inner.send_to(data, addr)?;
        }
        self.inner.send_to(data, addr)
    }

    fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        self.inner.recv_from(buf, timeout)
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}
