//! STUN message encoding and decoding.
//!
//! Messages are built and parsed directly against the RFC 8489 wire layout:
//! a 20-byte header (type, length, magic cookie, 96-bit transaction id)
//! followed by 4-byte-aligned TLV attributes. MESSAGE-INTEGRITY covers the
//! message up to (but excluding) its own attribute with the length field
//! patched accordingly; FINGERPRINT covers everything before itself and is
//! XOR'd with `0x5354554E`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 8489).
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// FINGERPRINT XOR constant, "STUN" in ASCII.
pub const FINGERPRINT_XOR: u32 = 0x5354_554E;

/// STUN header size: type + length + magic + transaction id.
pub const HEADER_SIZE: usize = 20;

/// STUN methods used by ICE and TURN.
pub mod methods {
    pub const BINDING: u16 = 0x001;
    pub const ALLOCATE: u16 = 0x003;
    pub const REFRESH: u16 = 0x004;
    pub const SEND: u16 = 0x006;
    pub const DATA: u16 = 0x007;
    pub const CREATE_PERMISSION: u16 = 0x008;
    pub const CHANNEL_BIND: u16 = 0x009;
}

/// STUN/TURN/ICE attribute types.
pub mod attrs {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const CHANNEL_NUMBER: u16 = 0x000C;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_PEER_ADDRESS: u16 = 0x0012;
    pub const DATA: u16 = 0x0013;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const SOFTWARE: u16 = 0x8022;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLED: u16 = 0x8029;
    pub const ICE_CONTROLLING: u16 = 0x802A;
}

/// Error codes the engine reacts to.
pub mod error_codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const ALLOCATION_MISMATCH: u16 = 437;
    pub const ROLE_CONFLICT: u16 = 487;
    pub const SERVER_ERROR: u16 = 500;
}

/// Protocol number for REQUESTED-TRANSPORT (UDP).
pub const TRANSPORT_UDP: u8 = 17;

/// Codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// Packet is shorter than the STUN header or truncated mid-attribute
    #[error("packet too short")]
    Truncated,

    /// Magic cookie or type bits do not match STUN
    #[error("not a STUN message")]
    NotStun,

    /// Header length field disagrees with the packet size
    #[error("length field mismatch")]
    LengthMismatch,

    /// MESSAGE-INTEGRITY verification failed
    #[error("message integrity check failed")]
    IntegrityFailed,

    /// FINGERPRINT verification failed
    #[error("fingerprint check failed")]
    FingerprintFailed,

    /// An attribute payload is malformed
    #[error("malformed {0:#06x} attribute")]
    MalformedAttribute(u16),

    /// A required attribute is absent
    #[error("missing {0:#06x} attribute")]
    MissingAttribute(u16),
}

/// 96-bit STUN transaction id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; 12]);

impl TransactionId {
    /// Generate a fresh id from the thread RNG.
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// STUN message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Request,
    Indication,
    SuccessResponse,
    ErrorResponse,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::SuccessResponse => 0b10,
            Class::ErrorResponse => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::SuccessResponse,
            _ => Class::ErrorResponse,
        }
    }

    /// Whether this class is a response (success or error).
    pub fn is_response(self) -> bool {
        matches!(self, Class::SuccessResponse | Class::ErrorResponse)
    }
}

/// Which integrity layers validated during decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Validation {
    /// MESSAGE-INTEGRITY was present and matched the provided key
    pub integrity: bool,
    /// FINGERPRINT was present and matched
    pub fingerprint: bool,
}

/// A raw attribute TLV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub typ: u16,
    pub value: Vec<u8>,
}

/// A decoded or under-construction STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    class: Class,
    method: u16,
    transaction_id: TransactionId,
    attributes: Vec<Attribute>,
}

impl Message {
    /// New message with a fresh random transaction id.
    pub fn new(class: Class, method: u16) -> Self {
        Self {
            class,
            method,
            transaction_id: TransactionId::generate(),
            attributes: Vec::new(),
        }
    }

    /// New message with an explicit transaction id (responses echo the
    /// request id).
    pub fn with_id(class: Class, method: u16, transaction_id: TransactionId) -> Self {
        Self {
            class,
            method,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> u16 {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn set_transaction_id(&mut self, id: TransactionId) {
        self.transaction_id = id;
    }

    /// Raw attribute lookup (first occurrence).
    pub fn attribute(&self, typ: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|a| a.typ == typ)
            .map(|a| a.value.as_slice())
    }

    pub fn has_attribute(&self, typ: u16) -> bool {
        self.attributes.iter().any(|a| a.typ == typ)
    }

    /// Append a raw attribute.
    pub fn add_attribute(&mut self, typ: u16, value: Vec<u8>) {
        self.attributes.push(Attribute { typ, value });
    }

    // ---- typed attribute helpers ----

    pub fn add_username(&mut self, username: &str) {
        self.add_attribute(attrs::USERNAME, username.as_bytes().to_vec());
    }

    pub fn username(&self) -> Option<&str> {
        self.attribute(attrs::USERNAME)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn add_software(&mut self, software: &str) {
        self.add_attribute(attrs::SOFTWARE, software.as_bytes().to_vec());
    }

    pub fn add_priority(&mut self, priority: u32) {
        self.add_attribute(attrs::PRIORITY, priority.to_be_bytes().to_vec());
    }

    pub fn priority(&self) -> Option<u32> {
        let v = self.attribute(attrs::PRIORITY)?;
        Some(u32::from_be_bytes(v.try_into().ok()?))
    }

    pub fn add_use_candidate(&mut self) {
        self.add_attribute(attrs::USE_CANDIDATE, Vec::new());
    }

    pub fn use_candidate(&self) -> bool {
        self.has_attribute(attrs::USE_CANDIDATE)
    }

    pub fn add_ice_controlling(&mut self, tie_breaker: u64) {
        self.add_attribute(attrs::ICE_CONTROLLING, tie_breaker.to_be_bytes().to_vec());
    }

    pub fn add_ice_controlled(&mut self, tie_breaker: u64) {
        self.add_attribute(attrs::ICE_CONTROLLED, tie_breaker.to_be_bytes().to_vec());
    }

    pub fn ice_controlling(&self) -> Option<u64> {
        let v = self.attribute(attrs::ICE_CONTROLLING)?;
        Some(u64::from_be_bytes(v.try_into().ok()?))
    }

    pub fn ice_controlled(&self) -> Option<u64> {
        let v = self.attribute(attrs::ICE_CONTROLLED)?;
        Some(u64::from_be_bytes(v.try_into().ok()?))
    }

    pub fn add_lifetime(&mut self, seconds: u32) {
        self.add_attribute(attrs::LIFETIME, seconds.to_be_bytes().to_vec());
    }

    pub fn lifetime(&self) -> Option<u32> {
        let v = self.attribute(attrs::LIFETIME)?;
        Some(u32::from_be_bytes(v.try_into().ok()?))
    }

    pub fn add_requested_transport(&mut self, protocol: u8) {
        self.add_attribute(attrs::REQUESTED_TRANSPORT, vec![protocol, 0, 0, 0]);
    }

    pub fn add_channel_number(&mut self, channel: u16) {
        let mut v = channel.to_be_bytes().to_vec();
        v.extend_from_slice(&[0, 0]);
        self.add_attribute(attrs::CHANNEL_NUMBER, v);
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.add_attribute(attrs::DATA, data.to_vec());
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.attribute(attrs::DATA)
    }

    pub fn add_error_code(&mut self, code: u16, reason: &str) {
        let mut v = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
        v.extend_from_slice(reason.as_bytes());
        self.add_attribute(attrs::ERROR_CODE, v);
    }

    pub fn error_code(&self) -> Option<(u16, String)> {
        let v = self.attribute(attrs::ERROR_CODE)?;
        if v.len() < 4 {
            return None;
        }
        let code = (v[2] & 0x07) as u16 * 100 + (v[3] % 100) as u16;
        let reason = String::from_utf8_lossy(&v[4..]).into_owned();
        Some((code, reason))
    }

    pub fn add_xor_mapped_address(&mut self, addr: SocketAddr) {
        let v = encode_xor_address(addr, self.transaction_id);
        self.add_attribute(attrs::XOR_MAPPED_ADDRESS, v);
    }

    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        self.attribute(attrs::XOR_MAPPED_ADDRESS)
            .and_then(|v| decode_xor_address(v, self.transaction_id))
            .or_else(|| {
                // some servers only send the pre-RFC5389 form
                self.attribute(attrs::MAPPED_ADDRESS)
                    .and_then(decode_plain_address)
            })
    }

    pub fn add_xor_peer_address(&mut self, addr: SocketAddr) {
        let v = encode_xor_address(addr, self.transaction_id);
        self.add_attribute(attrs::XOR_PEER_ADDRESS, v);
    }

    pub fn xor_peer_address(&self) -> Option<SocketAddr> {
        self.attribute(attrs::XOR_PEER_ADDRESS)
            .and_then(|v| decode_xor_address(v, self.transaction_id))
    }

    pub fn xor_relayed_address(&self) -> Option<SocketAddr> {
        self.attribute(attrs::XOR_RELAYED_ADDRESS)
            .and_then(|v| decode_xor_address(v, self.transaction_id))
    }

    pub fn add_xor_relayed_address(&mut self, addr: SocketAddr) {
        let v = encode_xor_address(addr, self.transaction_id);
        self.add_attribute(attrs::XOR_RELAYED_ADDRESS, v);
    }

    // ---- wire ----

    /// Encode the message. When `integrity_key` is given a MESSAGE-INTEGRITY
    /// attribute is appended; when `fingerprint` is set a FINGERPRINT
    /// attribute terminates the message.
    pub fn encode(&self, integrity_key: Option<&[u8]>, fingerprint: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 64);
        let msg_type = compose_type(self.class, self.method);
        buf.extend_from_slice(&msg_type.to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // length, patched below
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id.0);

        for attr in &self.attributes {
            buf.extend_from_slice(&attr.typ.to_be_bytes());
            buf.extend_from_slice(&(attr.value.len() as u16).to_be_bytes());
            buf.extend_from_slice(&attr.value);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        }

        if let Some(key) = integrity_key {
            // length must cover the MESSAGE-INTEGRITY attribute itself
            let claimed = (buf.len() - HEADER_SIZE + 24) as u16;
            buf[2..4].copy_from_slice(&claimed.to_be_bytes());
            let digest = hmac_sha1(key, &buf);
            buf.extend_from_slice(&attrs::MESSAGE_INTEGRITY.to_be_bytes());
            buf.extend_from_slice(&20u16.to_be_bytes());
            buf.extend_from_slice(&digest);
        }

        if fingerprint {
            let claimed = (buf.len() - HEADER_SIZE + 8) as u16;
            buf[2..4].copy_from_slice(&claimed.to_be_bytes());
            let crc = crc32(&buf) ^ FINGERPRINT_XOR;
            buf.extend_from_slice(&attrs::FINGERPRINT.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&crc.to_be_bytes());
        }

        let final_len = (buf.len() - HEADER_SIZE) as u16;
        buf[2..4].copy_from_slice(&final_len.to_be_bytes());
        buf
    }

    /// Decode a packet. Integrity layers are verified when present:
    /// FINGERPRINT always, MESSAGE-INTEGRITY when `integrity_key` is given.
    /// Verification failure is an error; mere absence is reported through
    /// [`Validation`].
    pub fn decode(
        packet: &[u8],
        integrity_key: Option<&[u8]>,
    ) -> Result<(Self, Validation), MessageError> {
        if packet.len() < HEADER_SIZE {
            return Err(MessageError::Truncated);
        }
        let msg_type = u16::from_be_bytes([packet[0], packet[1]]);
        if msg_type & 0xC000 != 0 {
            return Err(MessageError::NotStun);
        }
        let magic = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        if magic != MAGIC_COOKIE {
            return Err(MessageError::NotStun);
        }
        let length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if length % 4 != 0 || HEADER_SIZE + length != packet.len() {
            return Err(MessageError::LengthMismatch);
        }

        let (class, method) = decompose_type(msg_type);
        let mut id = [0u8; 12];
        id.copy_from_slice(&packet[8..20]);

        let mut attributes = Vec::new();
        let mut validation = Validation::default();
        let mut pos = HEADER_SIZE;
        let mut mi_offset = None;
        let mut fp_offset = None;

        while pos + 4 <= packet.len() {
            let typ = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
            let alen = u16::from_be_bytes([packet[pos + 2], packet[pos + 3]]) as usize;
            if pos + 4 + alen > packet.len() {
                return Err(MessageError::Truncated);
            }
            let value = packet[pos + 4..pos + 4 + alen].to_vec();
            match typ {
                attrs::MESSAGE_INTEGRITY if mi_offset.is_none() => mi_offset = Some(pos),
                attrs::FINGERPRINT if fp_offset.is_none() => fp_offset = Some(pos),
                _ => {}
            }
            attributes.push(Attribute { typ, value });
            pos += 4 + alen;
            pos += (4 - pos % 4) % 4;
        }

        if let Some(off) = fp_offset {
            let stored = attributes
                .iter()
                .find(|a| a.typ == attrs::FINGERPRINT)
                .and_then(|a| <[u8; 4]>::try_from(a.value.as_slice()).ok())
                .ok_or(MessageError::MalformedAttribute(attrs::FINGERPRINT))?;
            let expected = crc32(&packet[..off]) ^ FINGERPRINT_XOR;
            if u32::from_be_bytes(stored) != expected {
                return Err(MessageError::FingerprintFailed);
            }
            validation.fingerprint = true;
        }

        if let (Some(off), Some(key)) = (mi_offset, integrity_key) {
            let stored = attributes
                .iter()
                .find(|a| a.typ == attrs::MESSAGE_INTEGRITY)
                .map(|a| a.value.clone())
                .ok_or(MessageError::MalformedAttribute(attrs::MESSAGE_INTEGRITY))?;
            if stored.len() != 20 {
                return Err(MessageError::MalformedAttribute(attrs::MESSAGE_INTEGRITY));
            }
            // recompute with the length field covering up to the end of the
            // MESSAGE-INTEGRITY attribute
            let mut covered = packet[..off].to_vec();
            let claimed = (off - HEADER_SIZE + 24) as u16;
            covered[2..4].copy_from_slice(&claimed.to_be_bytes());
            let digest = hmac_sha1(key, &covered);
            if digest[..] != stored[..] {
                return Err(MessageError::IntegrityFailed);
            }
            validation.integrity = true;
        }

        Ok((
            Self {
                class,
                method,
                transaction_id: TransactionId(id),
                attributes,
            },
            validation,
        ))
    }

    /// Cheap shape check: does this packet look like STUN at all?
    pub fn is_probably_stun(packet: &[u8]) -> bool {
        if packet.len() < HEADER_SIZE {
            return false;
        }
        if packet[0] & 0xC0 != 0 {
            return false;
        }
        let magic = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        if magic != MAGIC_COOKIE {
            return false;
        }
        let length = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        length % 4 == 0 && HEADER_SIZE + length == packet.len()
    }

    /// Extract the transaction id without a full parse. The caller must have
    /// checked [`Message::is_probably_stun`] first.
    pub fn peek_transaction_id(packet: &[u8]) -> TransactionId {
        let mut id = [0u8; 12];
        id.copy_from_slice(&packet[8..20]);
        TransactionId(id)
    }

    /// Extract the class without a full parse.
    pub fn peek_class(packet: &[u8]) -> Class {
        let msg_type = u16::from_be_bytes([packet[0], packet[1]]);
        let bits = ((msg_type >> 7) & 0b10) | ((msg_type >> 4) & 0b01);
        Class::from_bits(bits)
    }
}

/// TURN ChannelData frame (RFC 8656 Section 12.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub channel: u16,
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Valid channel numbers span 0x4000..=0x7FFF.
    pub fn is_valid_channel(channel: u16) -> bool {
        (0x4000..=0x7FFF).contains(&channel)
    }

    /// Does this packet look like a ChannelData frame? (first two bits 0b01)
    pub fn is_channel_data(packet: &[u8]) -> bool {
        packet.len() >= 4 && packet[0] & 0xC0 == 0x40
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&self.channel.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(packet: &[u8]) -> Result<Self, MessageError> {
        if packet.len() < 4 {
            return Err(MessageError::Truncated);
        }
        let channel = u16::from_be_bytes([packet[0], packet[1]]);
        if !Self::is_valid_channel(channel) {
            return Err(MessageError::NotStun);
        }
        let len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if packet.len() < 4 + len {
            return Err(MessageError::Truncated);
        }
        Ok(Self {
            channel,
            data: packet[4..4 + len].to_vec(),
        })
    }
}

// method bits are interleaved around the class bits (RFC 8489 Section 5)
fn compose_type(class: Class, method: u16) -> u16 {
    let c = class.bits();
    ((method & 0x0F80) << 2)
        | ((method & 0x0070) << 1)
        | (method & 0x000F)
        | ((c & 0b10) << 7)
        | ((c & 0b01) << 4)
}

fn decompose_type(msg_type: u16) -> (Class, u16) {
    let class_bits = ((msg_type >> 7) & 0b10) | ((msg_type >> 4) & 0b01);
    let method =
        ((msg_type & 0x3E00) >> 2) | ((msg_type & 0x00E0) >> 1) | (msg_type & 0x000F);
    (Class::from_bits(class_bits), method)
}

fn encode_xor_address(addr: SocketAddr, id: TransactionId) -> Vec<u8> {
    let xport = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            let mut v = vec![0, 0x01];
            v.extend_from_slice(&xport.to_be_bytes());
            let raw = u32::from(ip) ^ MAGIC_COOKIE;
            v.extend_from_slice(&raw.to_be_bytes());
            v
        }
        IpAddr::V6(ip) => {
            let mut v = vec![0, 0x02];
            v.extend_from_slice(&xport.to_be_bytes());
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(&id.0);
            let octets = ip.octets();
            for (i, b) in octets.iter().enumerate() {
                v.push(b ^ mask[i]);
            }
            v
        }
    }
}

fn decode_xor_address(value: &[u8], id: TransactionId) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
    match value[1] {
        0x01 => {
            let raw = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(raw)), port))
        }
        0x02 if value.len() >= 20 => {
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(&id.0);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ mask[i];
            }
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn decode_plain_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    match value[1] {
        0x01 => {
            let ip = Ipv4Addr::new(value[4], value[5], value[6], value[7]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x02 if value.len() >= 20 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

// CRC-32 (IEEE 802.3, reflected 0xEDB88320), table built at compile time.
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    crc ^ 0xFFFF_FFFF
}
