//! UDP receive demultiplex — fixed table of port bindings.
//!
//! Datagram transmission is orchestrated by
//! [`Stack::udp_send`](crate::stack::Stack::udp_send); this module owns
//! the receive side: a bounded table mapping local ports to delivery
//! callbacks.  Handlers are plain function pointers (no captures, no
//! heap) and are invoked *outside* the stack's critical section with
//! the datagram's source address, source port, and payload.

use log::debug;

use crate::config::MAX_UDP_BINDINGS;
use crate::types::{Ipv6Addr, NetError};

/// Receive-delivery callback: `(source address, source port, payload)`.
///
/// Called outside the critical section; the handler may re-enter the
/// stack (e.g. send a response) without deadlocking.
pub type UdpHandler = fn(src: &Ipv6Addr, src_port: u16, payload: &[u8]);

#[derive(Clone, Copy)]
struct UdpBinding {
    port: u16,
    handler: UdpHandler,
}

/// Fixed table of [`MAX_UDP_BINDINGS`] port bindings.
pub struct UdpBindings {
    entries: [Option<UdpBinding>; MAX_UDP_BINDINGS],
}

impl UdpBindings {
    /// An empty table.
    pub const fn new() -> Self {
        Self {
            entries: [None; MAX_UDP_BINDINGS],
        }
    }

    /// Bind `handler` to `port`.
    ///
    /// Rebinding an already-bound port replaces its handler.  A port of
    /// 0 is rejected with [`NetError::InvalidParam`]; a full table with
    /// [`NetError::NoBuffer`].
    pub fn bind(&mut self, port: u16, handler: UdpHandler) -> Result<(), NetError> {
        if port == 0 {
            return Err(NetError::InvalidParam);
        }

        for slot in self.entries.iter_mut() {
            if let Some(binding) = slot {
                if binding.port == port {
                    binding.handler = handler;
                    return Ok(());
                }
            }
        }

        for slot in self.entries.iter_mut() {
            if slot.is_none() {
                *slot = Some(UdpBinding { port, handler });
                debug!("udp: bound port {}", port);
                return Ok(());
            }
        }

        Err(NetError::NoBuffer)
    }

    /// Remove the binding for `port`, if any.
    pub fn unbind(&mut self, port: u16) {
        for slot in self.entries.iter_mut() {
            if matches!(slot, Some(b) if b.port == port) {
                *slot = None;
                debug!("udp: unbound port {}", port);
            }
        }
    }

    /// Handler registered for `port`.
    pub fn lookup(&self, port: u16) -> Option<UdpHandler> {
        self.entries
            .iter()
            .flatten()
            .find(|b| b.port == port)
            .map(|b| b.handler)
    }

    /// Number of active bindings (diagnostic).
    pub fn binding_count(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    /// Clear every binding.
    pub fn reset(&mut self) {
        self.entries = [None; MAX_UDP_BINDINGS];
    }
}
