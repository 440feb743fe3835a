use core::{mem, net::Ipv4Addr};

/// XDP → userspace record describing one inspected IPv4 packet.
///
/// Every field is a byte or a byte array so the struct has alignment 1 and
/// no padding: the ring buffer carries exactly [`PacketEvent::LEN`] bytes
/// and both sides read them through this one definition.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketEvent {
    /// Source address, network byte order.
    pub source_address: [u8; 4],
    /// Destination address, network byte order.
    pub destination_address: [u8; 4],
    /// IPv4 protocol number.
    pub protocol: u8,
    /// ICMP message type when `protocol` is ICMP, zero otherwise.
    pub subtype: u8,
}

const _: () = assert!(mem::size_of::<PacketEvent>() == 10);
const _: () = assert!(mem::align_of::<PacketEvent>() == 1);

impl PacketEvent {
    pub const LEN: usize = mem::size_of::<PacketEvent>();

    /// Decodes a record from the head of `bytes`.
    ///
    /// Returns `None` when fewer than [`PacketEvent::LEN`] bytes are
    /// available. Trailing bytes are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; PacketEvent::LEN] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(Self {
            source_address: [bytes[0], bytes[1], bytes[2], bytes[3]],
            destination_address: [bytes[4], bytes[5], bytes[6], bytes[7]],
            protocol: bytes[8],
            subtype: bytes[9],
        })
    }

    pub fn to_bytes(&self) -> [u8; PacketEvent::LEN] {
        let mut out = [0u8; PacketEvent::LEN];
        out[..4].copy_from_slice(&self.source_address);
        out[4..8].copy_from_slice(&self.destination_address);
        out[8] = self.protocol;
        out[9] = self.subtype;
        out
    }

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.source_address)
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.destination_address)
    }

    pub fn is_echo_request(&self) -> bool {
        self.protocol == crate::IPPROTO_ICMP && self.subtype == crate::ICMP_ECHO_REQUEST
    }
}
