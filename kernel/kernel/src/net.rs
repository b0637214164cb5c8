//! Network service: the stack singleton, the `net` task, and blocking
//! helpers for collaborators (the browser, the shell's net commands).

use quasar_core::sync::SpinLock;
use quasar_net::{IfaceConfig, Ipv4Addr, NetStack, TcpState};

use crate::config::PIT_HZ;
use crate::drivers::e1000::E1000Nic;
use crate::time;

/// DNS resolve timeout.
const DNS_TIMEOUT_TICKS: u64 = 3 * PIT_HZ;

/// The stack behind its lock; `None` until a NIC probes successfully.
pub struct NetService {
    stack: SpinLock<Option<NetStack<E1000Nic>>>,
}

impl NetService {
    /// An empty service.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stack: SpinLock::new(None),
        }
    }

    /// Probes the NIC and starts DHCP discovery.
    pub fn init(&self) {
        match E1000Nic::probe() {
            Some(nic) => {
                let stack = NetStack::new(nic, PIT_HZ, time::ticks());
                *self.stack.lock() = Some(stack);
                crate::kinfo!("net: stack up, acquiring lease");
            }
            None => crate::kwarn!("net: no NIC found, networking disabled"),
        }
    }

    /// One service pass: drain RX, run timers.
    pub fn poll(&self) {
        if let Some(stack) = self.stack.lock().as_mut() {
            stack.poll(time::ticks());
        }
    }

    /// Whether DHCP has bound an address.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.stack.lock().as_ref().is_some_and(NetStack::is_up)
    }

    /// Current interface addressing.
    #[must_use]
    pub fn config(&self) -> IfaceConfig {
        self.stack
            .lock()
            .as_ref()
            .map(NetStack::config)
            .unwrap_or_default()
    }

    /// Synchronous DNS lookup: sends the query and polls for up to
    /// three seconds, yielding between passes.
    pub fn dns_resolve(&self, host: &str) -> Option<Ipv4Addr> {
        {
            let mut stack = self.stack.lock();
            if !stack.as_mut()?.dns_query(host, time::ticks()) {
                return None;
            }
        }
        let deadline = time::ticks() + DNS_TIMEOUT_TICKS;
        while time::ticks() < deadline {
            self.poll();
            {
                let mut stack = self.stack.lock();
                let stack = stack.as_mut()?;
                if !stack.dns_pending() {
                    return stack.dns_take_result();
                }
            }
            crate::kernel::kernel().sched.sleep(1);
        }
        if let Some(stack) = self.stack.lock().as_mut() {
            stack.dns_cancel();
        }
        None
    }

    /// Opens the TCP connection.
    pub fn tcp_connect(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.stack
            .lock()
            .as_mut()
            .is_some_and(|s| s.tcp_connect(ip, port, time::ticks()))
    }

    /// Whether the handshake has completed.
    #[must_use]
    pub fn tcp_is_established(&self) -> bool {
        self.stack
            .lock()
            .as_ref()
            .is_some_and(NetStack::tcp_is_established)
    }

    /// Whether the connection is closed or half-closed by the peer.
    #[must_use]
    pub fn tcp_is_closed(&self) -> bool {
        self.stack
            .lock()
            .as_ref()
            .is_none_or(NetStack::tcp_is_closed)
    }

    /// Current connection state.
    #[must_use]
    pub fn tcp_state(&self) -> TcpState {
        self.stack
            .lock()
            .as_ref()
            .map_or(TcpState::Closed, NetStack::tcp_state)
    }

    /// Sends a chunk on the connection; returns bytes accepted.
    pub fn tcp_send(&self, data: &[u8]) -> usize {
        self.stack
            .lock()
            .as_mut()
            .map_or(0, |s| s.tcp_send(data, time::ticks()))
    }

    /// Drains received bytes into `out`.
    pub fn tcp_recv(&self, out: &mut [u8]) -> usize {
        self.stack.lock().as_mut().map_or(0, |s| s.tcp_recv(out))
    }

    /// Starts an orderly close.
    pub fn tcp_close(&self) {
        if let Some(stack) = self.stack.lock().as_mut() {
            stack.tcp_close(time::ticks());
        }
    }
}

impl Default for NetService {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the `net` task: poll, sleep a tick, repeat.
pub extern "C" fn net_task(_arg: usize) {
    let kernel = crate::kernel::kernel();
    loop {
        kernel.net.poll();
        kernel.sched.sleep(1);
    }
}
