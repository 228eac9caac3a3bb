#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

//! Wire types and ring-buffer primitives shared between the eBPF producer
//! and the userspace consumer. Kept `no_std` under the `bpf` feature so the
//! same crate compiles into the kernel-side program; the `user` feature adds
//! `serde` derives for the daemon and its control surface.

pub mod device;
pub mod event;
pub mod ioclass;
pub mod ring;

pub use device::{decode_dev_id, encode_dev_id};
pub use event::{
    CTime, DeviceDescBody, FileEventKind, FsFileEventBody, FsFileNameBody, FsMetaBody, IoBody,
    IoCmplBody, IoFlags, IoOperation, RecordHeader, RecordType, FS_FILE_NAME_MAX, PROTOCOL_MAGIC,
    PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR,
};
pub use ioclass::{classify_file_size_class, IoClass};
pub use ring::{
    Consumer, Producer, RingHeader, RING_DATA_BYTES, RING_HEADER_BYTES, RING_MAGIC,
    RING_REGION_BYTES,
};

/// Hard cap on the number of devices a single tracer instance can track at
/// once, mirrored by the per-CPU device registry map.
pub const MAX_TRACED_DEVICES: usize = 16;

/// Ceiling on a single per-CPU ring's size, enforced by the daemon before it
/// ever asks the kernel to allocate one.
pub const MAX_RING_SIZE_MB: usize = 4096;
