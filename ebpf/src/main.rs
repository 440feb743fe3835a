#![cfg_attr(target_arch = "bpf", no_std)]
#![cfg_attr(target_arch = "bpf", no_main)]

#[cfg(not(target_arch = "bpf"))]
fn main() {}

#[cfg(target_arch = "bpf")]
use core::mem;

#[cfg(target_arch = "bpf")]
use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{ring_buf::RingBufEntry, RingBuf},
    programs::XdpContext,
};
#[cfg(target_arch = "bpf")]
use aya_log_ebpf::debug;
#[cfg(target_arch = "bpf")]
use pingwall_common::{
    classify, headers::Header, EventSink, EventSlot, PacketEvent, PacketView, Verdict,
    EVENT_CHANNEL_CAPACITY,
};

#[cfg(target_arch = "bpf")]
#[map(name = "EVENTS")]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENT_CHANNEL_CAPACITY, 0);

#[cfg(target_arch = "bpf")]
#[xdp]
pub fn pingwall(ctx: XdpContext) -> u32 {
    match classify(&Frame(&ctx), &RingBufSink(&EVENTS)) {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => {
            debug!(&ctx, "dropping ICMP echo request");
            xdp_action::XDP_DROP
        }
    }
}

/// Packet bytes between `data` and `data_end` of the XDP context.
#[cfg(target_arch = "bpf")]
struct Frame<'a>(&'a XdpContext);

#[cfg(target_arch = "bpf")]
impl PacketView for Frame<'_> {
    #[inline(always)]
    fn load<T: Header>(&self, offset: usize) -> Option<T> {
        let start = self.0.data();
        let end = self.0.data_end();
        if start + offset + mem::size_of::<T>() > end {
            return None;
        }
        // SAFETY: the range was checked against `data_end` above, which is
        // also what the verifier needs to see before the access.
        Some(unsafe { ((start + offset) as *const T).read_unaligned() })
    }
}

#[cfg(target_arch = "bpf")]
struct RingBufSink(&'static RingBuf);

#[cfg(target_arch = "bpf")]
struct RingBufSlot(RingBufEntry<PacketEvent>);

#[cfg(target_arch = "bpf")]
impl EventSink for RingBufSink {
    type Slot<'a> = RingBufSlot;

    #[inline(always)]
    fn reserve(&self) -> Option<RingBufSlot> {
        self.0.reserve::<PacketEvent>(0).map(RingBufSlot)
    }
}

#[cfg(target_arch = "bpf")]
impl EventSlot for RingBufSlot {
    #[inline(always)]
    fn submit(mut self, event: PacketEvent) {
        self.0.write(event);
        self.0.submit(0);
    }

    #[inline(always)]
    fn discard(self) {
        self.0.discard(0);
    }
}

#[cfg(target_arch = "bpf")]
#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";

#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}
