//! Consumer side of the event channel.

use std::{
    fmt,
    future::Future,
    io::{self, Write},
    os::fd::AsRawFd,
    time::Duration,
};

use aya::maps::{MapData, RingBuf};
use pingwall_common::PacketEvent;
use tokio::{
    io::{unix::AsyncFd, Interest},
    time,
};
use tracing::warn;

use crate::error::ChannelError;

/// Drains records produced by the classifier.
pub trait EventChannel {
    /// Waits up to `timeout` for the channel to become readable, then hands
    /// every available record to `on_event`. Returns how many were handed
    /// over; a timeout with nothing to read is `Ok(0)`.
    fn poll(
        &mut self,
        timeout: Duration,
        on_event: &mut dyn FnMut(PacketEvent),
    ) -> impl Future<Output = Result<usize, ChannelError>>;
}

/// Event channel backed by the classifier's BPF ring buffer map.
pub struct RingBufChannel {
    ring: AsyncFd<RingBuf<MapData>>,
}

impl RingBufChannel {
    pub fn new(ring: RingBuf<MapData>) -> io::Result<Self> {
        Ok(Self {
            ring: register_readable(ring)?,
        })
    }
}

/// Registers `inner` with the tokio reactor for read readiness.
///
/// `inner` must own its fd: the registration relies on the fd staying open
/// and unchanged until the returned `AsyncFd` is dropped.
fn register_readable<T: AsRawFd>(inner: T) -> io::Result<AsyncFd<T>> {
    // SAFETY: `inner` owns the fd and moves into the `AsyncFd`, so the fd
    // stays open for as long as the registration exists.
    Ok(unsafe { AsyncFd::register_with_interest(inner, Interest::READABLE)? })
}

impl EventChannel for RingBufChannel {
    async fn poll(
        &mut self,
        timeout: Duration,
        on_event: &mut dyn FnMut(PacketEvent),
    ) -> Result<usize, ChannelError> {
        let drained = match time::timeout(timeout, self.ring.readable_mut()).await {
            Ok(Ok(mut guard)) => {
                let drained = drain(guard.get_inner_mut(), on_event);
                guard.clear_ready();
                Some(drained)
            }
            Ok(Err(e)) => return Err(ChannelError::Fault(e)),
            Err(_elapsed) => None,
        };

        // Readiness is edge triggered; a record submitted between the last
        // read and `clear_ready` is picked up on the next timeout.
        Ok(match drained {
            Some(drained) => drained,
            None => drain(self.ring.get_mut(), on_event),
        })
    }
}

fn drain(ring: &mut RingBuf<MapData>, on_event: &mut dyn FnMut(PacketEvent)) -> usize {
    let mut handed_over = 0;
    while let Some(item) = ring.next() {
        if let Some(event) = decode_record(&item) {
            on_event(event);
            handed_over += 1;
        }
    }
    handed_over
}

/// Decodes one raw ring buffer record, logging and skipping undersized ones.
pub fn decode_record(bytes: &[u8]) -> Option<PacketEvent> {
    let event = PacketEvent::from_bytes(bytes);
    if event.is_none() {
        warn!(
            len = bytes.len(),
            expected = PacketEvent::LEN,
            "ring buffer returned undersized record"
        );
    }
    event
}

/// Writes one [`EventLine`] per record.
///
/// Write failures do not stop the consumer. The first one is logged, the
/// rest are only counted.
pub struct EventPrinter<W> {
    out: W,
    failed: u64,
}

impl<W: Write> EventPrinter<W> {
    pub fn new(out: W) -> Self {
        Self { out, failed: 0 }
    }

    pub fn print(&mut self, event: &PacketEvent) {
        if let Err(e) = writeln!(self.out, "{}", EventLine(event)) {
            if self.failed == 0 {
                warn!(error = %e, "failed to write event, further write errors are not logged");
            }
            self.failed += 1;
        }
    }

    /// Records that could not be written.
    pub fn failed(&self) -> u64 {
        self.failed
    }
}

/// One human-readable output line per record.
pub struct EventLine<'a>(pub &'a PacketEvent);

impl fmt::Display for EventLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = self.0;
        write!(
            f,
            "{} -> {} protocol={} ({}) subtype={}",
            event.source(),
            event.destination(),
            event.protocol,
            protocol_name(event.protocol),
            event.subtype,
        )?;
        if event.is_echo_request() {
            f.write_str(" dropped")?;
        }
        Ok(())
    }
}

fn protocol_name(protocol: u8) -> &'static str {
    match protocol {
        1 => "icmp",
        2 => "igmp",
        6 => "tcp",
        17 => "udp",
        47 => "gre",
        50 => "esp",
        51 => "ah",
        132 => "sctp",
        _ => "other",
    }
}
