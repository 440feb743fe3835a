//! Minimal wire headers read by the classifier.
//!
//! Multi-byte fields are kept as byte arrays in network order so every
//! header has alignment 1 and can be read at any packet offset.

use core::mem;

/// Marker for plain-old-data headers that may be read from raw packet bytes.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no padding, and accept every
/// bit pattern as a valid value.
pub unsafe trait Header: Copy {
    const LEN: usize = mem::size_of::<Self>();
}

/// Ethernet II header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct EthHdr {
    pub dst_addr: [u8; 6],
    pub src_addr: [u8; 6],
    pub ether_type: [u8; 2],
}

unsafe impl Header for EthHdr {}

impl EthHdr {
    #[inline(always)]
    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes(self.ether_type)
    }
}

/// IPv4 header without options.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Ipv4Hdr {
    pub vihl: u8,
    pub tos: u8,
    pub tot_len: [u8; 2],
    pub id: [u8; 2],
    pub frag_off: [u8; 2],
    pub ttl: u8,
    pub proto: u8,
    pub check: [u8; 2],
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
}

unsafe impl Header for Ipv4Hdr {}

impl Ipv4Hdr {
    #[inline(always)]
    pub fn version(&self) -> u8 {
        self.vihl >> 4
    }

    /// Header length in bytes, options included.
    #[inline(always)]
    pub fn header_len(&self) -> usize {
        ((self.vihl & 0x0f) as usize) * 4
    }
}

/// ICMP header as laid out in RFC 792, including the 4-byte rest-of-header.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct IcmpHdr {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: [u8; 2],
    pub rest: [u8; 4],
}

unsafe impl Header for IcmpHdr {}

const _: () = assert!(EthHdr::LEN == 14);
const _: () = assert!(Ipv4Hdr::LEN == 20);
const _: () = assert!(IcmpHdr::LEN == 8);
