#![cfg_attr(not(feature = "std"), no_std)]

pub mod classify;
pub mod event;
pub mod headers;

pub use classify::{classify, EventSink, EventSlot, PacketView, Verdict};
pub use event::PacketEvent;

/// Size in bytes of the ring buffer shared between the XDP program and
/// userspace. The kernel rejects ring buffers that are not a power of two
/// multiple of the page size.
pub const EVENT_CHANNEL_CAPACITY: u32 = 1 << 24;

const _: () = assert!(EVENT_CHANNEL_CAPACITY.is_power_of_two());
const _: () = assert!(EVENT_CHANNEL_CAPACITY >= 4096);

/// EtherType of IPv4.
pub const ETH_P_IP: u16 = 0x0800;

/// IPv4 protocol number of ICMP.
pub const IPPROTO_ICMP: u8 = 1;

/// ICMP message type of an echo request (ping).
pub const ICMP_ECHO_REQUEST: u8 = 8;
