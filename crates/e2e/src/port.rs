//! Local TCP port allocation
//!
//! Ports are found by binding, not by counting: a [`PortReservation`] holds
//! the bound listener, so two allocators racing from the same hint can never
//! be handed the same port while either reservation is alive.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use tracing::debug;

use crate::error::{E2eError, E2eResult};

/// Highest port the allocator will try
pub const MAX_PORT: u16 = u16::MAX;

/// A bound, listening socket on a port nobody else holds
#[derive(Debug)]
pub struct PortReservation {
    listener: TcpListener,
    port: u16,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hand the bound socket to a server
    pub fn into_listener(self) -> TcpListener {
        self.listener
    }

    /// Drop the socket and return the bare port number
    ///
    /// Used when the port is handed to another process; from here on the
    /// port is only as free as the OS says it is.
    pub fn release(self) -> u16 {
        self.port
    }
}

/// Reserve the first bindable local port at or above `start`
pub fn reserve(start: u16) -> E2eResult<PortReservation> {
    reserve_in(start, MAX_PORT)
}

/// Reserve the first bindable port in `start..=end`
pub fn reserve_in(start: u16, end: u16) -> E2eResult<PortReservation> {
    for port in start..=end {
        // Port 0 asks the OS for an ephemeral port, which is not what was asked for
        if port == 0 {
            continue;
        }
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match TcpListener::bind(addr) {
            Ok(listener) => {
                debug!("Reserved port {}", port);
                return Ok(PortReservation { listener, port });
            }
            Err(e) => {
                debug!("Port {} unavailable: {}", port, e);
            }
        }
    }

    Err(E2eError::PortExhausted { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_respects_hint() {
        let reservation = reserve(20_000).unwrap();
        assert!(reservation.port() >= 20_000);
    }

    #[test]
    fn test_held_reservations_never_collide() {
        let first = reserve(21_000).unwrap();
        let second = reserve(21_000).unwrap();
        assert_ne!(first.port(), second.port());
    }

    #[test]
    fn test_back_to_back_allocations_differ() {
        let a = reserve(25_000).unwrap();
        let b = reserve(25_000).unwrap();
        assert_ne!(a.port(), b.port());
        assert!(b.port() > a.port());
    }

    #[test]
    fn test_occupied_port_is_skipped() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let reservation = reserve_in(port, port.saturating_add(50)).unwrap();
        assert_ne!(reservation.port(), port);
    }

    #[test]
    fn test_exhausted_range_fails() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        match reserve_in(port, port) {
            Err(E2eError::PortExhausted { start, end }) => {
                assert_eq!(start, port);
                assert_eq!(end, port);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_reservations_are_distinct() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| reserve(22_000).unwrap()))
            .collect();
        let reservations: Vec<PortReservation> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let mut ports: Vec<u16> = reservations.iter().map(PortReservation::port).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 4);
    }
}
