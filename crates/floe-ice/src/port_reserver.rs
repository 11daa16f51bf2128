//! Pre-bound UDP socket pool.
//!
//! An application that negotiates ports ahead of time (for example to set up
//! firewall rules) can hand the agent pre-bound sockets instead of letting
//! each transport bind a random port. The reserver stays externally owned:
//! borrowed sockets are returned on transport teardown, never closed by the
//! engine.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;

/// Externally owned pool of pre-bound UDP sockets.
#[derive(Debug, Default)]
pub struct UdpPortReserver {
    sockets: Mutex<Vec<Arc<UdpSocket>>>,
}

impl UdpPortReserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `count` fresh sockets on each given address and add them to the
    /// pool.
    pub async fn reserve(&self, addrs: &[IpAddr], count: usize) -> std::io::Result<()> {
        let mut bound = Vec::new();
        for addr in addrs {
            for _ in 0..count {
                let socket = UdpSocket::bind(SocketAddr::new(*addr, 0)).await?;
                bound.push(Arc::new(socket));
            }
        }
        self.sockets.lock().extend(bound);
        Ok(())
    }

    /// Take a socket bound to `addr`, if the pool has one.
    pub fn borrow(&self, addr: IpAddr) -> Option<Arc<UdpSocket>> {
        let mut sockets = self.sockets.lock();
        let at = sockets
            .iter()
            .position(|s| s.local_addr().map(|a| a.ip() == addr).unwrap_or(false))?;
        Some(sockets.swap_remove(at))
    }

    /// Return a previously borrowed socket.
    pub fn give_back(&self, socket: Arc<UdpSocket>) {
        self.sockets.lock().push(socket);
    }

    pub fn available(&self) -> usize {
        self.sockets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_borrow_and_return() {
        let reserver = UdpPortReserver::new();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        reserver.reserve(&[loopback], 2).await.unwrap();
        assert_eq!(reserver.available(), 2);

        let sock = reserver.borrow(loopback).unwrap();
        assert_eq!(reserver.available(), 1);
        let port = sock.local_addr().unwrap().port();
        assert_ne!(port, 0);

        reserver.give_back(sock);
        assert_eq!(reserver.available(), 2);

        // no sockets for an address we never reserved
        assert!(reserver.borrow("127.0.0.2".parse().unwrap()).is_none());
    }
}
