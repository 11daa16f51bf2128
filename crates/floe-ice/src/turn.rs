//! TURN client state for a local transport.
//!
//! Holds the allocation bookkeeping (relayed/reflexive addresses, lifetime,
//! permissions, channel bindings) and builds the TURN messages; the owning
//! transport performs the actual I/O through its transaction pool. Channel
//! numbers come from the 0x4000..=0x7FFF range; once a peer is bound,
//! relayed traffic to it uses the 4-byte ChannelData header instead of the
//! 36-byte Send indication.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use floe_stun::{methods, ChannelData, Class, Message, TRANSPORT_UDP};
use tracing::debug;

use crate::addr::TransportAddress;

/// Fallback allocation lifetime when the server does not say.
pub(crate) const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

const FIRST_CHANNEL: u16 = 0x4000;
const LAST_CHANNEL: u16 = 0x7FFF;

/// Per-allocation TURN state.
#[derive(Debug)]
pub(crate) struct TurnClient {
    pub server: SocketAddr,
    pub username: String,
    pub key: Vec<u8>,
    /// Set once the Allocate succeeded
    pub active: bool,
    pub relayed: Option<TransportAddress>,
    pub reflexive: Option<TransportAddress>,
    pub lifetime: Duration,
    channels: HashMap<TransportAddress, u16>,
    channels_rev: HashMap<u16, TransportAddress>,
    pending_channels: HashSet<TransportAddress>,
    permissions: HashSet<IpAddr>,
    pending_permissions: HashSet<IpAddr>,
    /// Datagrams waiting for a permission to be installed, per peer
    queued: HashMap<TransportAddress, Vec<Vec<u8>>>,
    next_channel: u16,
}

impl TurnClient {
    pub fn new(server: SocketAddr, username: String, key: Vec<u8>) -> Self {
        Self {
            server,
            username,
            key,
            active: false,
            relayed: None,
            reflexive: None,
            lifetime: DEFAULT_LIFETIME,
            channels: HashMap::new(),
            channels_rev: HashMap::new(),
            pending_channels: HashSet::new(),
            permissions: HashSet::new(),
            pending_permissions: HashSet::new(),
            queued: HashMap::new(),
            next_channel: FIRST_CHANNEL,
        }
    }

    // ---- message builders ----

    pub fn allocate_request(&self) -> Message {
        let mut msg = Message::new(Class::Request, methods::ALLOCATE);
        msg.add_requested_transport(TRANSPORT_UDP);
        msg
    }

    pub fn refresh_request(&self, lifetime: Duration) -> Message {
        let mut msg = Message::new(Class::Request, methods::REFRESH);
        msg.add_lifetime(lifetime.as_secs() as u32);
        msg
    }

    pub fn permission_request(&self, peer: TransportAddress) -> Message {
        let mut msg = Message::new(Class::Request, methods::CREATE_PERMISSION);
        msg.add_xor_peer_address(peer.unscoped());
        msg
    }

    pub fn channel_bind_request(&self, peer: TransportAddress, channel: u16) -> Message {
        let mut msg = Message::new(Class::Request, methods::CHANNEL_BIND);
        msg.add_channel_number(channel);
        msg.add_xor_peer_address(peer.unscoped());
        msg
    }

    // ---- allocation lifecycle ----

    pub fn on_allocated(&mut self, relayed: Option<SocketAddr>, reflexive: Option<SocketAddr>, lifetime: Option<u32>) {
        self.active = true;
        self.relayed = relayed.map(TransportAddress::from);
        self.reflexive = reflexive.map(TransportAddress::from);
        if let Some(secs) = lifetime {
            self.lifetime = Duration::from_secs(secs.max(60) as u64);
        }
        debug!(relayed = ?self.relayed, lifetime = ?self.lifetime, "TURN allocation active");
    }

    /// When to refresh: well before the advertised lifetime runs out.
    pub fn refresh_after(&self) -> Duration {
        self.lifetime.mul_f32(0.75)
    }

    // ---- permissions ----

    /// Begin installing a permission for `peer` unless one exists or is in
    /// flight. Returns true when a CreatePermission should be issued.
    pub fn want_permission(&mut self, peer: TransportAddress) -> bool {
        let ip = peer.ip();
        if self.permissions.contains(&ip) || self.pending_permissions.contains(&ip) {
            return false;
        }
        self.pending_permissions.insert(ip);
        true
    }

    pub fn on_permission_installed(&mut self, ip: IpAddr) -> Vec<(TransportAddress, Vec<u8>)> {
        self.pending_permissions.remove(&ip);
        self.permissions.insert(ip);
        // release everything queued on this peer IP
        let peers: Vec<TransportAddress> = self
            .queued
            .keys()
            .filter(|peer| peer.ip() == ip)
            .copied()
            .collect();
        let mut out = Vec::new();
        for peer in peers {
            if let Some(datagrams) = self.queued.remove(&peer) {
                out.extend(datagrams.into_iter().map(|d| (peer, d)));
            }
        }
        out
    }

    pub fn on_permission_failed(&mut self, ip: IpAddr) {
        self.pending_permissions.remove(&ip);
        self.queued.retain(|peer, _| peer.ip() != ip);
    }

    /// All installed permissions, for re-installation after a refresh.
    pub fn permissions(&self) -> Vec<IpAddr> {
        self.permissions.iter().copied().collect()
    }

    pub fn has_permission(&self, peer: TransportAddress) -> bool {
        self.permissions.contains(&peer.ip())
    }

    pub fn queue_for_permission(&mut self, peer: TransportAddress, datagram: Vec<u8>) {
        const MAX_QUEUED: usize = 16;
        let q = self.queued.entry(peer).or_default();
        if q.len() < MAX_QUEUED {
            q.push(datagram);
        }
    }

    // ---- channels ----

    /// Reserve a channel number for `peer`. Returns the number to bind, or
    /// None when already bound/binding or numbers ran out.
    pub fn want_channel(&mut self, peer: TransportAddress) -> Option<u16> {
        if self.channels.contains_key(&peer)
            || self.pending_channels.contains(&peer)
            || self.next_channel > LAST_CHANNEL
        {
            return None;
        }
        self.pending_channels.insert(peer);
        let channel = self.next_channel;
        self.next_channel += 1;
        Some(channel)
    }

    pub fn on_channel_bound(&mut self, peer: TransportAddress, channel: u16) {
        self.pending_channels.remove(&peer);
        self.channels.insert(peer, channel);
        self.channels_rev.insert(channel, peer);
        // a channel bind implies a permission
        self.permissions.insert(peer.ip());
        debug!(%peer, channel, "TURN channel bound");
    }

    pub fn on_channel_failed(&mut self, peer: TransportAddress) {
        self.pending_channels.remove(&peer);
    }

    pub fn peer_for_channel(&self, channel: u16) -> Option<TransportAddress> {
        self.channels_rev.get(&channel).copied()
    }

    /// Wrap an outgoing datagram for the relay: ChannelData when bound,
    /// otherwise a Send indication.
    pub fn wrap_send(&self, data: &[u8], peer: TransportAddress) -> Vec<u8> {
        if let Some(channel) = self.channels.get(&peer) {
            ChannelData {
                channel: *channel,
                data: data.to_vec(),
            }
            .encode()
        } else {
            let mut msg = Message::new(Class::Indication, methods::SEND);
            msg.add_xor_peer_address(peer.unscoped());
            msg.add_data(data);
            msg.encode(None, false)
        }
    }

    /// Unwrap a Data indication into `(peer, payload)`.
    pub fn unwrap_data_indication(msg: &Message) -> Option<(TransportAddress, Vec<u8>)> {
        let peer = msg.xor_peer_address()?;
        let data = msg.data()?.to_vec();
        Some((TransportAddress::from(peer), data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> TransportAddress {
        TransportAddress::from(s.parse::<SocketAddr>().unwrap())
    }

    fn client() -> TurnClient {
        TurnClient::new(
            "203.0.113.9:3478".parse().unwrap(),
            "user".into(),
            b"pass".to_vec(),
        )
    }

    #[test]
    fn test_allocation_lifetime() {
        let mut c = client();
        assert!(!c.active);
        c.on_allocated(
            Some("203.0.113.9:49152".parse().unwrap()),
            Some("198.51.100.5:41000".parse().unwrap()),
            Some(1200),
        );
        assert!(c.active);
        assert_eq!(c.lifetime, Duration::from_secs(1200));
        assert_eq!(c.refresh_after(), Duration::from_secs(900));
        // servers advertising absurdly short lifetimes are clamped
        c.on_allocated(None, None, Some(1));
        assert_eq!(c.lifetime, Duration::from_secs(60));
    }

    #[test]
    fn test_permission_queueing_and_release() {
        let mut c = client();
        let p = peer("192.0.2.7:4000");

        assert!(c.want_permission(p));
        assert!(!c.want_permission(p)); // already pending

        c.queue_for_permission(p, b"one".to_vec());
        c.queue_for_permission(p, b"two".to_vec());
        let released = c.on_permission_installed(p.ip());
        assert_eq!(released.len(), 2);
        assert!(c.has_permission(p));
        assert!(!c.want_permission(p)); // installed now

        // same IP, different port shares the permission
        assert!(c.has_permission(peer("192.0.2.7:9999")));
    }

    #[test]
    fn test_permission_failure_drops_queue() {
        let mut c = client();
        let p = peer("192.0.2.7:4000");
        assert!(c.want_permission(p));
        c.queue_for_permission(p, b"lost".to_vec());
        c.on_permission_failed(p.ip());
        assert!(!c.has_permission(p));
        // a later retry is possible
        assert!(c.want_permission(p));
    }

    #[test]
    fn test_channel_allocation_sequence() {
        let mut c = client();
        let p1 = peer("192.0.2.7:4000");
        let p2 = peer("192.0.2.8:4000");

        let ch1 = c.want_channel(p1).unwrap();
        let ch2 = c.want_channel(p2).unwrap();
        assert_eq!(ch1, 0x4000);
        assert_eq!(ch2, 0x4001);
        assert!(c.want_channel(p1).is_none()); // pending

        c.on_channel_bound(p1, ch1);
        assert!(c.want_channel(p1).is_none()); // bound
        assert_eq!(c.peer_for_channel(ch1), Some(p1));
        assert!(c.has_permission(p1)); // implied
    }

    #[test]
    fn test_wrap_send_uses_channel_when_bound() {
        let mut c = client();
        let p = peer("192.0.2.7:4000");

        // unbound: a Send indication
        let wrapped = c.wrap_send(b"payload", p);
        let (msg, _) = Message::decode(&wrapped, None).unwrap();
        assert_eq!(msg.class(), Class::Indication);
        assert_eq!(msg.method(), methods::SEND);
        assert_eq!(msg.data(), Some(&b"payload"[..]));
        assert_eq!(msg.xor_peer_address(), Some(p.socket_addr()));

        // bound: the 4-byte channel header
        let ch = c.want_channel(p).unwrap();
        c.on_channel_bound(p, ch);
        let wrapped = c.wrap_send(b"payload", p);
        assert_eq!(wrapped.len(), 4 + 7);
        let cd = ChannelData::decode(&wrapped).unwrap();
        assert_eq!(cd.channel, ch);
        assert_eq!(cd.data, b"payload");
    }

    #[test]
    fn test_data_indication_roundtrip() {
        let p = peer("192.0.2.7:4000");
        let mut msg = Message::new(Class::Indication, methods::DATA);
        msg.add_xor_peer_address(p.socket_addr());
        msg.add_data(b"inner");
        let (peer_addr, payload) = TurnClient::unwrap_data_indication(&msg).unwrap();
        assert_eq!(peer_addr, p);
        assert_eq!(payload, b"inner");
    }

    #[test]
    fn test_request_builders() {
        let c = client();
        let alloc = c.allocate_request();
        assert_eq!(alloc.class(), Class::Request);
        assert_eq!(alloc.method(), methods::ALLOCATE);

        let refresh = c.refresh_request(Duration::ZERO);
        assert_eq!(refresh.lifetime(), Some(0));

        let p = peer("192.0.2.7:4000");
        let bind = c.channel_bind_request(p, 0x4005);
        assert_eq!(bind.method(), methods::CHANNEL_BIND);
        assert_eq!(bind.xor_peer_address(), Some(p.socket_addr()));
    }
}
