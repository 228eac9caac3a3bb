//! Userspace side of the per-CPU mmap ring: wraps one CPU's region of the
//! `RING_REGION` BPF map (mmapped read-write so the consumer can publish
//! `consumer_pos`) and drains committed records into owned [`DecodedEvent`]
//! values the rest of the daemon can route to sinks.

use std::io;

use iotrace_common::{
    event::{
        DeviceDescBody, FsFileEventBody, FsFileNameBody, FsMetaBody, IoBody, IoCmplBody,
        RecordHeader,
    },
    ring::{Consumer, RingHeader},
    RecordType,
};
use memmap2::MmapMut;

const MADV_HUGEPAGE: libc::c_int = 14;

/// Request transparent huge pages for a ring region. Best-effort: failure
/// just means the daemon runs without the TLB-miss optimization.
fn advise_hugepages(ptr: *mut u8, len: usize) {
    let ret = unsafe { libc::madvise(ptr as *mut libc::c_void, len, MADV_HUGEPAGE) };
    if ret != 0 {
        log::debug!(
            "MADV_HUGEPAGE failed for ring region ({} KiB): {}",
            len / 1024,
            io::Error::last_os_error()
        );
    }
}

/// One decoded record, tagged with the CPU its ring came from. Variants
/// mirror `iotrace_common::event::RecordType`, minus `Padding` which the
/// consumer skips transparently.
#[derive(Debug, Clone)]
pub enum DecodedEvent {
    DeviceDesc(DeviceDescBody),
    Io(IoBody),
    IoCmpl(IoCmplBody),
    FsMeta(FsMetaBody),
    FsFileName(FsFileNameBody),
    FsFileEvent(FsFileEventBody),
}

/// Per-CPU ring consumer. Holds the mmap alive for the daemon's lifetime.
pub struct RingConsumer {
    pub cpu: usize,
    mmap: MmapMut,
    header_offset: usize,
}

impl RingConsumer {
    /// `mmap` must cover exactly one CPU's `RingRegion`: a `RingHeader`
    /// immediately followed by its data bytes, as laid out by the eBPF
    /// producer in `iotrace-ebpf/src/program.rs`.
    pub fn new(cpu: usize, mmap: MmapMut) -> Self {
        advise_hugepages(mmap.as_ptr() as *mut u8, mmap.len());
        Self {
            cpu,
            mmap,
            header_offset: 0,
        }
    }

    fn header(&self) -> &RingHeader {
        let ptr = unsafe { self.mmap.as_ptr().add(self.header_offset) } as *const RingHeader;
        unsafe { &*ptr }
    }

    fn data(&self) -> &[u8] {
        let header_bytes = std::mem::size_of::<RingHeader>();
        &self.mmap[self.header_offset + header_bytes..]
    }

    /// Drain every record currently available without blocking, decoding
    /// each into a [`DecodedEvent`]. Returns the number of records lost to
    /// producer-side overflow since the last drain (for metrics).
    pub fn drain(&self, out: &mut Vec<DecodedEvent>) -> u64 {
        let header = self.header();
        let consumer = unsafe { Consumer::new(header, self.data()) };
        while let Some((hdr, body)) = consumer.next() {
            if let Some(event) = decode(&hdr, body) {
                out.push(event);
            }
            consumer.release(&hdr);
        }
        consumer.lost_count()
    }

    pub fn is_closed(&self) -> bool {
        self.header().is_closed()
    }
}

fn decode(header: &RecordHeader, body: &[u8]) -> Option<DecodedEvent> {
    match header.record_type()? {
        RecordType::DeviceDesc => Some(DecodedEvent::DeviceDesc(*bytemuck::from_bytes(body))),
        RecordType::Io => Some(DecodedEvent::Io(*bytemuck::from_bytes(body))),
        RecordType::IoCmpl => Some(DecodedEvent::IoCmpl(*bytemuck::from_bytes(body))),
        RecordType::FsMeta => Some(DecodedEvent::FsMeta(*bytemuck::from_bytes(body))),
        RecordType::FsFileName => Some(DecodedEvent::FsFileName(*bytemuck::from_bytes(body))),
        RecordType::FsFileEvent => Some(DecodedEvent::FsFileEvent(*bytemuck::from_bytes(body))),
        RecordType::Padding => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotrace_common::event::{IoOperation, RecordType};
    use iotrace_common::ring::Producer;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    fn make_region(capacity: usize) -> MmapMut {
        let header_bytes = std::mem::size_of::<RingHeader>();
        let mut mmap = MmapMut::map_anon(header_bytes + capacity).unwrap();
        let header_ptr = mmap.as_mut_ptr() as *mut RingHeader;
        unsafe {
            header_ptr.write(RingHeader {
                magic: AtomicU64::new(0),
                capacity: AtomicUsize::new(0),
                producer_pos: AtomicUsize::new(0),
                consumer_pos: AtomicUsize::new(0),
                lost_count: AtomicU64::new(0),
                closed: AtomicUsize::new(0),
            });
            (*header_ptr).init(capacity);
        }
        mmap
    }

    #[test]
    fn drains_committed_io_record() {
        let mut mmap = make_region(4096);
        {
            let header_bytes = std::mem::size_of::<RingHeader>();
            let header = unsafe { &*(mmap.as_ptr() as *const RingHeader) };
            let data = &mut mmap[header_bytes..];
            let mut producer = unsafe { Producer::new(header, data) };
            let body = IoBody {
                id: 7,
                lba: 0,
                len_sectors: 8,
                _pad0: 0,
                dev_id: 1,
                operation: IoOperation::Write as u8,
                _pad1: 0,
                flags: 0,
                write_hint: 0,
                _pad2: 0,
                io_class: 11,
            };
            let bytes = bytemuck::bytes_of(&body);
            let res = producer.reserve(bytes.len()).unwrap();
            let hdr = RecordHeader::new(RecordType::Io, bytes.len() as u32, 1, 42);
            producer.commit(res, hdr, bytes);
        }

        let consumer = RingConsumer::new(0, mmap);
        let mut out = Vec::new();
        let lost = consumer.drain(&mut out);
        assert_eq!(lost, 0);
        assert_eq!(out.len(), 1);
        match &out[0] {
            DecodedEvent::Io(body) => assert_eq!(body.id, 7),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
