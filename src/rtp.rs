// src/rtp.rs - RTP payload extraction and the reordering window
//
// The reordering window absorbs the small out-of-order bursts typical of
// IGMP-delivered RTP without adding perceptible latency: 16 slots keyed by
// sequence number, with a timeout that declares a missing packet lost rather
// than stalling the stream.

use crate::pool::BufRef;

/// Window size. Power of two so slot indexing is a mask.
pub const REORDER_WINDOW: usize = 16;
/// How long to hold packets behind a gap before declaring the gap lost.
pub const REORDER_TIMEOUT_MS: i64 = 50;
/// Packets this far behind the expected sequence count as stale duplicates;
/// anything further back is treated as a stream reset (±W/2 of the 16-bit
/// space splits ahead from behind).
const LATE_GRACE: i16 = REORDER_WINDOW as i16 / 2;

const FEC_PAYLOAD_TYPE_1: u8 = 127;
const FEC_PAYLOAD_TYPE_2: u8 = 97;

/// Signed distance from `b` to `a` modulo 2^16; wraparound-aware.
pub fn seq_diff(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Result of classifying one upstream datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtpPayload {
    /// Well-formed RTP: payload location and sequence number.
    Rtp { start: usize, len: usize, seq: u16 },
    /// Not RTP; forward the whole datagram as opaque MPEG-TS.
    Raw,
    /// Malformed RTP or FEC; drop silently.
    Discard,
}

/// Classify a datagram and locate its payload. The RTP check is the
/// first-byte heuristic: version bits 2 and a minimum 12-byte header. A
/// misclassified packet desyncs reordering for at most one window.
pub fn parse_payload(data: &[u8]) -> RtpPayload {
    if data.len() < 12 || data[0] & 0xC0 != 0x80 {
        return RtpPayload::Raw;
    }

    let payload_type = data[1] & 0x7F;
    if payload_type == FEC_PAYLOAD_TYPE_1 || payload_type == FEC_PAYLOAD_TYPE_2 {
        return RtpPayload::Discard;
    }

    let seq = u16::from_be_bytes([data[2], data[3]]);
    let flags = data[0];

    let mut start = 12 + (flags & 0x0F) as usize * 4;
    if flags & 0x10 != 0 {
        // Extension header.
        if start + 4 > data.len() {
            return RtpPayload::Discard;
        }
        let ext_words = u16::from_be_bytes([data[start + 2], data[start + 3]]) as usize;
        start += 4 + 4 * ext_words;
    }

    if start > data.len() {
        return RtpPayload::Discard;
    }
    let mut len = data.len() - start;
    if flags & 0x20 != 0 {
        // Padding; the final octet holds the pad length.
        let pad = data[data.len() - 1] as usize;
        if pad > len {
            return RtpPayload::Discard;
        }
        len -= pad;
    }
    if len == 0 {
        return RtpPayload::Discard;
    }
    RtpPayload::Rtp { start, len, seq }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReorderStats {
    pub out_of_order: u64,
    pub duplicates: u64,
    pub recovered: u64,
    pub drops: u64,
}

/// Sliding reordering window. Buffers pushed in arrive with their payload
/// offset/len applied and their sequence cached; emission happens through
/// the sink in sequence order.
pub struct ReorderWindow {
    slots: [Option<BufRef>; REORDER_WINDOW],
    expected: u16,
    first_packet: bool,
    waiting: bool,
    wait_start: i64,
    held: usize,
    pub stats: ReorderStats,
}

impl ReorderWindow {
    pub fn new() -> Self {
        ReorderWindow {
            slots: Default::default(),
            expected: 0,
            first_packet: true,
            waiting: false,
            wait_start: 0,
            held: 0,
            stats: ReorderStats::default(),
        }
    }

    pub fn waiting(&self) -> bool {
        self.waiting
    }

    /// Handle one RTP packet. `sink` receives packets in emission order.
    pub fn push(&mut self, buf: BufRef, seq: u16, now: i64, sink: &mut dyn FnMut(BufRef)) {
        if self.first_packet {
            self.first_packet = false;
            self.expected = seq.wrapping_add(1);
            sink(buf);
            return;
        }

        let diff = seq.wrapping_sub(self.expected) as i16;

        if diff == 0 {
            // In order: emit and flush any contiguous run behind it.
            self.expected = self.expected.wrapping_add(1);
            sink(buf);
            self.flush_contiguous(sink);
            if self.held == 0 {
                self.waiting = false;
            }
            return;
        }

        if diff > 0 && (diff as usize) < REORDER_WINDOW {
            // Ahead within the window: hold it.
            self.stats.out_of_order += 1;
            let idx = seq as usize % REORDER_WINDOW;
            let occupant_seq = self.slots[idx].as_ref().and_then(|b| b.rtp_seq());
            if occupant_seq == Some(seq) {
                self.stats.duplicates += 1;
            } else {
                if self.slots[idx].is_none() {
                    self.held += 1;
                }
                // A mismatched occupant is stale; replace it.
                self.slots[idx] = Some(buf);
            }
            if !self.waiting {
                self.waiting = true;
                self.wait_start = now;
            }
            return;
        }

        if diff < 0 && diff >= -LATE_GRACE {
            // Late arrival of something already emitted or skipped.
            self.stats.duplicates += 1;
            return;
        }

        // Too far ahead or far behind: stream reset.
        log::debug!(
            "RTP sequence jump (expected {}, got {}), resetting window",
            self.expected,
            seq
        );
        self.drop_held();
        self.waiting = false;
        self.expected = seq.wrapping_add(1);
        sink(buf);
    }

    /// Timeout recovery: declare the gap lost, emit what is contiguous after
    /// it, and restart the wait if holes remain.
    pub fn tick(&mut self, now: i64, sink: &mut dyn FnMut(BufRef)) {
        if !self.waiting || now - self.wait_start < REORDER_TIMEOUT_MS {
            return;
        }

        // Find the first held packet after the gap.
        let mut skipped = 0u64;
        for _ in 0..REORDER_WINDOW {
            if self.slots[self.expected as usize % REORDER_WINDOW]
                .as_ref()
                .map(|b| b.rtp_seq() == Some(self.expected))
                .unwrap_or(false)
            {
                break;
            }
            self.expected = self.expected.wrapping_add(1);
            skipped += 1;
        }
        self.stats.drops += skipped;
        log::debug!("RTP reorder timeout, {} packet(s) declared lost", skipped);

        self.flush_contiguous(sink);
        if self.held > 0 {
            // Still holding non-contiguous packets; restart the clock.
            self.wait_start = now;
        } else {
            self.waiting = false;
        }
    }

    fn flush_contiguous(&mut self, sink: &mut dyn FnMut(BufRef)) {
        loop {
            let idx = self.expected as usize % REORDER_WINDOW;
            let matches = self.slots[idx]
                .as_ref()
                .map(|b| b.rtp_seq() == Some(self.expected))
                .unwrap_or(false);
            if !matches {
                break;
            }
            let buf = self.slots[idx].take().expect("slot checked above");
            self.held -= 1;
            self.expected = self.expected.wrapping_add(1);
            self.stats.recovered += 1;
            sink(buf);
        }
    }

    fn drop_held(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.take().is_some() {
                self.stats.drops += 1;
            }
        }
        self.held = 0;
    }

    /// Release all held buffers (teardown).
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
        self.held = 0;
        self.waiting = false;
    }
}

impl Default for ReorderWindow {
    fn default() -> Self {
        Self::new()
    }
}
