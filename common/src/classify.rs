//! Per-packet drop policy shared by the XDP program and host tests.

use core::mem;

use crate::{
    headers::{EthHdr, Header, IcmpHdr, Ipv4Hdr},
    PacketEvent, ETH_P_IP, ICMP_ECHO_REQUEST, IPPROTO_ICMP,
};

/// Decision taken for one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Drop,
}

/// Bounds-checked read access to the bytes of one packet.
pub trait PacketView {
    /// Copies the header at `offset` out of the packet, or returns `None`
    /// if the packet ends before the header does.
    fn load<T: Header>(&self, offset: usize) -> Option<T>;
}

impl PacketView for [u8] {
    #[inline(always)]
    fn load<T: Header>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(mem::size_of::<T>())?;
        let bytes = self.get(offset..end)?;
        // SAFETY: `bytes` spans exactly `size_of::<T>()` bytes and `Header`
        // guarantees every bit pattern is a valid `T`.
        Some(unsafe { (bytes.as_ptr() as *const T).read_unaligned() })
    }
}

/// Producer side of the event channel.
///
/// `reserve` must never block: under capacity pressure it returns `None`
/// and the caller carries on without a record.
pub trait EventSink {
    type Slot<'a>: EventSlot
    where
        Self: 'a;

    fn reserve(&self) -> Option<Self::Slot<'_>>;
}

/// A reserved, not yet visible, record slot.
///
/// The record is written in full as part of `submit`, so a consumer never
/// sees a partially populated record. Dropping a slot without calling
/// either method is left to the implementation; callers always pick one.
pub trait EventSlot {
    fn submit(self, event: PacketEvent);
    fn discard(self);
}

/// Classifies one Ethernet frame, dropping ICMP echo requests.
///
/// Frames that are not complete Ethernet + IPv4 are passed without a record.
/// For the rest a record is reserved before the transport header is parsed;
/// if the ICMP header turns out to be truncated the reservation is discarded.
/// Failing to reserve only loses the record, the verdict is unaffected.
#[inline(always)]
pub fn classify<P, S>(packet: &P, sink: &S) -> Verdict
where
    P: PacketView + ?Sized,
    S: EventSink,
{
    let Some(eth) = packet.load::<EthHdr>(0) else {
        return Verdict::Pass;
    };
    if eth.ether_type() != ETH_P_IP {
        return Verdict::Pass;
    }

    let Some(ip) = packet.load::<Ipv4Hdr>(EthHdr::LEN) else {
        return Verdict::Pass;
    };
    let ip_len = ip.header_len();
    if ip_len < Ipv4Hdr::LEN {
        return Verdict::Pass;
    }

    let slot = sink.reserve();
    let mut event = PacketEvent {
        source_address: ip.src_addr,
        destination_address: ip.dst_addr,
        protocol: ip.proto,
        subtype: 0,
    };
    let mut verdict = Verdict::Pass;

    if ip.proto == IPPROTO_ICMP {
        let Some(icmp) = packet.load::<IcmpHdr>(EthHdr::LEN + ip_len) else {
            if let Some(slot) = slot {
                slot.discard();
            }
            return Verdict::Pass;
        };
        event.subtype = icmp.icmp_type;
        if icmp.icmp_type == ICMP_ECHO_REQUEST {
            verdict = Verdict::Drop;
        }
    }

    if let Some(slot) = slot {
        slot.submit(event);
    }
    verdict
}
