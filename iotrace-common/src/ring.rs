//! Lock-free single-producer/single-consumer byte ring shared between a
//! kernel-side producer (one per CPU) and the userspace consumer reading the
//! same region through an mmap of a `BPF_F_MMAPABLE` array map.
//!
//! The data region is a flat byte buffer of `capacity` bytes, `capacity`
//! always a power of two. Positions are monotonically increasing counters
//! mod `2 * capacity` (the "index doubling" trick): the low bits select the
//! byte offset, the extra bit disambiguates a full-vs-empty ring without a
//! separate flag. A record that would cross the end of the buffer is instead
//! preceded by a `Padding` record filling the remainder, and the real record
//! restarts at offset 0.
//!
//! Producer and consumer each own one position: the producer only ever
//! writes `producer_pos`, the consumer only ever writes `consumer_pos`. Each
//! side reads the other's position with `Acquire` and publishes its own with
//! `Release`, and a record's header is always written *after* its body, so a
//! consumer that observes a header has a fully-written body behind it.

use crate::event::RecordHeader;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

pub const RING_MAGIC: u64 = 0x5254_4E47_4330_3031; // "RNGC001"

/// Per-CPU data region size backing `RING_REGION`. `iotrace-ebpf` lays out
/// each CPU's map value as `[RingHeader][RING_DATA_BYTES of data]`; userspace
/// mmaps the same map and must agree on this constant to compute offsets.
pub const RING_DATA_BYTES: usize = 1 << 16;
pub const RING_HEADER_BYTES: usize = core::mem::size_of::<RingHeader>();
pub const RING_REGION_BYTES: usize = RING_HEADER_BYTES + RING_DATA_BYTES;

/// Header living at the front of the shared mmap region, ahead of the data
/// buffer itself.
#[repr(C)]
pub struct RingHeader {
    pub magic: AtomicU64,
    pub capacity: AtomicUsize,
    pub producer_pos: AtomicUsize,
    pub consumer_pos: AtomicUsize,
    pub lost_count: AtomicU64,
    pub closed: AtomicUsize,
}

impl RingHeader {
    pub fn init(&self, capacity: usize) {
        debug_assert!(capacity.is_power_of_two());
        self.magic.store(RING_MAGIC, Ordering::Relaxed);
        self.capacity.store(capacity, Ordering::Relaxed);
        self.producer_pos.store(0, Ordering::Relaxed);
        self.consumer_pos.store(0, Ordering::Relaxed);
        self.lost_count.store(0, Ordering::Relaxed);
        self.closed.store(0, Ordering::Release);
    }

    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Relaxed) == RING_MAGIC
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) != 0
    }

    pub fn close(&self) {
        self.closed.store(1, Ordering::Release);
    }

    pub fn lost_count(&self) -> u64 {
        self.lost_count.load(Ordering::Relaxed)
    }

    /// Fraction of capacity currently occupied, `0.0..=1.0`. Used by the
    /// producer to decide when to raise the "almost full" wakeup.
    pub fn occupancy(&self) -> f32 {
        let cap = self.capacity.load(Ordering::Relaxed);
        if cap == 0 {
            return 0.0;
        }
        let used = self.used_bytes();
        used as f32 / cap as f32
    }

    fn used_bytes(&self) -> usize {
        let cap = self.capacity.load(Ordering::Relaxed);
        let p = self.producer_pos.load(Ordering::Acquire);
        let c = self.consumer_pos.load(Ordering::Acquire);
        // positions live mod 2*capacity; unsigned wraparound-safe subtraction
        (p.wrapping_sub(c)) % (2 * cap.max(1))
    }
}

/// Reservation ticket returned by [`Producer::reserve`]. Must be committed
/// or aborted exactly once.
pub struct Reservation {
    offset: usize,
    total_len: usize,
    wrapped_pad: Option<usize>,
}

/// Producer-side handle. One per CPU; never shared across threads.
pub struct Producer<'a> {
    header: &'a RingHeader,
    data: &'a mut [u8],
}

impl<'a> Producer<'a> {
    /// # Safety
    /// `data` must be exactly `header.capacity` bytes and must not alias any
    /// other `Producer`/`Consumer` over the same region except as intended
    /// (shared mmap).
    pub unsafe fn new(header: &'a RingHeader, data: &'a mut [u8]) -> Self {
        Self { header, data }
    }

    fn capacity(&self) -> usize {
        self.header.capacity.load(Ordering::Relaxed)
    }

    /// Reserve `body_len` bytes of payload (header + body). Returns `None`
    /// if the ring does not have room; the caller must then increment its
    /// own loss counter and bump `lost_count`.
    pub fn reserve(&mut self, body_len: usize) -> Option<Reservation> {
        if body_len == 0 {
            return None;
        }
        let cap = self.capacity();
        let record_len = RecordHeader::SIZE + body_len;
        if record_len > cap / 2 {
            return None;
        }
        let p = self.header.producer_pos.load(Ordering::Relaxed);
        let c = self.header.consumer_pos.load(Ordering::Acquire);
        let used = p.wrapping_sub(c) % (2 * cap);
        let free = cap - used;

        let raw_off = p % cap;
        let until_wrap = cap - raw_off;

        if until_wrap < record_len {
            // Need a padding record to fill the tail, then the real record
            // restarts at offset 0.
            let pad_len = until_wrap;
            let total_needed = pad_len + record_len;
            if total_needed > free {
                self.header.lost_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(Reservation {
                offset: 0,
                total_len: record_len,
                wrapped_pad: Some(pad_len),
            })
        } else {
            if record_len > free {
                self.header.lost_count.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(Reservation {
                offset: raw_off,
                total_len: record_len,
                wrapped_pad: None,
            })
        }
    }

    /// Write `header` and `body` into the reservation and publish it.
    pub fn commit(&mut self, res: Reservation, header: RecordHeader, body: &[u8]) {
        debug_assert_eq!(RecordHeader::SIZE + body.len(), res.total_len);

        if let Some(pad_len) = res.wrapped_pad {
            let cap = self.capacity();
            let pad_off = self.header.producer_pos.load(Ordering::Relaxed) % cap;
            self.write_padding(pad_off, pad_len);
        }

        let hdr_bytes: &[u8] = bytemuck::bytes_of(&header);
        self.write_bytes(res.offset, hdr_bytes);
        self.write_bytes(res.offset + RecordHeader::SIZE, body);

        let advance = res.wrapped_pad.unwrap_or(0) + res.total_len;
        let new_pos = self
            .header
            .producer_pos
            .load(Ordering::Relaxed)
            .wrapping_add(advance);
        self.header.producer_pos.store(new_pos, Ordering::Release);
    }

    fn write_padding(&mut self, offset: usize, len: usize) {
        if len < RecordHeader::SIZE {
            // Degenerate case: can't fit even a padding header; caller's
            // capacity/record-length bounds should make this unreachable
            // in practice, but zero the gap defensively.
            for b in &mut self.data[offset..offset + len] {
                *b = 0;
            }
            return;
        }
        let hdr = RecordHeader::new(crate::event::RecordType::Padding, (len - RecordHeader::SIZE) as u32, 0, 0);
        self.write_bytes(offset, bytemuck::bytes_of(&hdr));
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        let cap = self.data.len();
        let end = offset + bytes.len();
        debug_assert!(end <= cap, "record write must not cross ring end");
        self.data[offset..end].copy_from_slice(bytes);
    }

    /// Drop a reservation without publishing it (e.g. encode error). No
    /// position is advanced; the slot is simply unused on the next reserve.
    pub fn abort(&mut self, _res: Reservation) {}

    pub fn is_almost_full(&self, threshold: f32) -> bool {
        self.header.occupancy() >= threshold
    }
}

/// Consumer-side handle, used by the userspace daemon.
pub struct Consumer<'a> {
    header: &'a RingHeader,
    data: &'a [u8],
}

impl<'a> Consumer<'a> {
    /// # Safety
    /// `data` must be exactly `header.capacity` bytes.
    pub unsafe fn new(header: &'a RingHeader, data: &'a [u8]) -> Self {
        Self { header, data }
    }

    fn capacity(&self) -> usize {
        self.header.capacity.load(Ordering::Relaxed)
    }

    /// Read the next record at the current consumer position, if the
    /// producer has published one. Skips over padding records
    /// transparently. Returns the header and a borrowed slice of the body.
    pub fn next(&self) -> Option<(RecordHeader, &'a [u8])> {
        loop {
            let cap = self.capacity();
            let c = self.header.consumer_pos.load(Ordering::Relaxed);
            let p = self.header.producer_pos.load(Ordering::Acquire);
            if c == p {
                return None;
            }
            let off = c % cap;
            let hdr_bytes = &self.data[off..off + RecordHeader::SIZE];
            let header: RecordHeader = *bytemuck::from_bytes(hdr_bytes);
            let body_off = off + RecordHeader::SIZE;
            let body = &self.data[body_off..body_off + header.size as usize];

            if header.record_type() == Some(crate::event::RecordType::Padding) {
                let advance = RecordHeader::SIZE + header.size as usize;
                self.header
                    .consumer_pos
                    .store(c.wrapping_add(advance), Ordering::Release);
                continue;
            }
            return Some((header, body));
        }
    }

    /// Release the most recently returned record, advancing the consumer
    /// position past it.
    pub fn release(&self, header: &RecordHeader) {
        let cap = self.capacity();
        let c = self.header.consumer_pos.load(Ordering::Relaxed);
        let off = c % cap;
        let record_len = RecordHeader::SIZE + header.size as usize;
        // account for a padding record we may have skipped just before this
        // one was reserved at offset 0
        let until_wrap = cap - off;
        let advance = if until_wrap < record_len {
            until_wrap + record_len
        } else {
            record_len
        };
        self.header
            .consumer_pos
            .store(c.wrapping_add(advance), Ordering::Release);
    }

    pub fn lost_count(&self) -> u64 {
        self.header.lost_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{IoBody, RecordType};

    fn make_ring(capacity: usize) -> (RingHeader, Vec<u8>) {
        let header = RingHeader {
            magic: AtomicU64::new(0),
            capacity: AtomicUsize::new(0),
            producer_pos: AtomicUsize::new(0),
            consumer_pos: AtomicUsize::new(0),
            lost_count: AtomicU64::new(0),
            closed: AtomicUsize::new(0),
        };
        header.init(capacity);
        (header, vec![0u8; capacity])
    }

    fn io_body(id: u64) -> IoBody {
        IoBody {
            id,
            lba: 0,
            len_sectors: 8,
            _pad0: 0,
            dev_id: 1,
            operation: 0,
            _pad1: 0,
            flags: 0,
            write_hint: 0,
            _pad2: 0,
            io_class: 11,
        }
    }

    #[test]
    fn reserve_commit_consume_roundtrip() {
        let (header, mut data) = make_ring(4096);
        let mut producer = unsafe { Producer::new(&header, &mut data) };
        let body = io_body(42);
        let body_bytes = bytemuck::bytes_of(&body);
        let res = producer.reserve(body_bytes.len()).expect("reserve");
        let hdr = RecordHeader::new(RecordType::Io, body_bytes.len() as u32, 1, 100);
        producer.commit(res, hdr, body_bytes);

        let consumer = unsafe { Consumer::new(&header, &data) };
        let (got_hdr, got_body) = consumer.next().expect("next");
        assert_eq!(got_hdr.record_type(), Some(RecordType::Io));
        let got: IoBody = *bytemuck::from_bytes(got_body);
        assert_eq!(got.id, 42);
        consumer.release(&got_hdr);
        assert!(consumer.next().is_none());
    }

    #[test]
    fn wraps_with_padding_when_tail_too_small() {
        let rec_len = RecordHeader::SIZE + core::mem::size_of::<IoBody>();
        // capacity big enough to hold several io-sized records under the
        // capacity/2 reservation ceiling
        let capacity = (rec_len * 4).next_power_of_two();
        let (header, mut data) = make_ring(capacity);
        let mut producer = unsafe { Producer::new(&header, &mut data) };

        // a small filler record misaligns the write cursor relative to
        // `rec_len` so a later io-sized reserve can't fit before the end
        let filler = [0xABu8; 8];
        let res = producer.reserve(filler.len()).unwrap();
        let hdr = RecordHeader::new(RecordType::Padding, filler.len() as u32, 0, 0);
        producer.commit(res, hdr, &filler);

        let body = io_body(1);
        let body_bytes = bytemuck::bytes_of(&body);
        for i in 0..3u64 {
            let res = producer.reserve(body_bytes.len()).unwrap();
            let hdr = RecordHeader::new(RecordType::Io, body_bytes.len() as u32, i, i);
            producer.commit(res, hdr, body_bytes);
        }

        // drain everything, freeing capacity while leaving the write cursor
        // close to the ring's end
        let consumer = unsafe { Consumer::new(&header, &data) };
        while let Some((hdr, _)) = consumer.next() {
            consumer.release(&hdr);
        }

        // only `capacity - cursor` bytes remain before the end, less than
        // rec_len: this reserve must pad-and-wrap back to offset 0
        let wrapped = io_body(99);
        let wrapped_bytes = bytemuck::bytes_of(&wrapped);
        let res = producer
            .reserve(wrapped_bytes.len())
            .expect("should wrap, not fail");
        let hdr = RecordHeader::new(RecordType::Io, wrapped_bytes.len() as u32, 10, 10);
        producer.commit(res, hdr, wrapped_bytes);

        let (got_hdr, got_body) = consumer.next().expect("wrapped record readable");
        assert_eq!(got_hdr.record_type(), Some(RecordType::Io));
        let got: IoBody = *bytemuck::from_bytes(got_body);
        assert_eq!(got.id, 99);
        consumer.release(&got_hdr);
    }

    #[test]
    fn full_ring_reports_loss() {
        let rec_len = RecordHeader::SIZE + core::mem::size_of::<IoBody>();
        // exactly two records fit; a third must fail and bump lost_count
        let capacity = (rec_len * 2).next_power_of_two();
        let (header, mut data) = make_ring(capacity);
        let mut producer = unsafe { Producer::new(&header, &mut data) };

        let body = io_body(1);
        let body_bytes = bytemuck::bytes_of(&body);
        for i in 0..2u64 {
            let res = producer.reserve(body_bytes.len()).unwrap();
            let hdr = RecordHeader::new(RecordType::Io, body_bytes.len() as u32, i, i);
            producer.commit(res, hdr, body_bytes);
        }

        // ring is now full (consumer hasn't released); next reserve of any
        // size should fail and bump lost_count
        assert!(producer.reserve(body_bytes.len()).is_none());
        assert_eq!(header.lost_count(), 1);
    }

    #[test]
    fn zero_size_reservation_rejected() {
        let (header, mut data) = make_ring(4096);
        let mut producer = unsafe { Producer::new(&header, &mut data) };
        assert!(producer.reserve(0).is_none());
    }

    #[test]
    fn oversized_reservation_rejected() {
        let (header, mut data) = make_ring(1024);
        let mut producer = unsafe { Producer::new(&header, &mut data) };
        // a record larger than capacity/2 must be rejected even on an empty ring
        assert!(producer.reserve(1024 - RecordHeader::SIZE).is_none());
    }

    #[test]
    fn almost_full_threshold() {
        let (header, mut data) = make_ring(1024);
        let mut producer = unsafe { Producer::new(&header, &mut data) };
        assert!(!producer.is_almost_full(0.5));

        let body = io_body(1);
        let body_bytes = bytemuck::bytes_of(&body);
        for i in 0..15u64 {
            let res = producer.reserve(body_bytes.len());
            let Some(res) = res else { break };
            let hdr = RecordHeader::new(RecordType::Io, body_bytes.len() as u32, i, i);
            producer.commit(res, hdr, body_bytes);
        }
        assert!(producer.is_almost_full(0.5));
    }
}
