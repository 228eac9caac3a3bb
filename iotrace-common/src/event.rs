//! Wire-stable event records shared between the kernel producer and the
//! userspace consumer. Every record begins with [`RecordHeader`]; the body
//! that follows is picked by `RecordHeader::type_`.

use bytemuck::{Pod, Zeroable};

/// Protocol build identifier, embedded in every ring header and returned by
/// the `version` control endpoint.
pub const PROTOCOL_MAGIC: u64 = 0x494F_5452_4143_4531; // "IOTRACE1"
pub const PROTOCOL_VERSION_MAJOR: u8 = 1;
pub const PROTOCOL_VERSION_MINOR: u8 = 0;

#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum RecordType {
    DeviceDesc = 0,
    Io = 1,
    IoCmpl = 2,
    FsMeta = 3,
    FsFileName = 4,
    FsFileEvent = 5,
    Padding = 6,
}

impl RecordType {
    pub const fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::DeviceDesc),
            1 => Some(Self::Io),
            2 => Some(Self::IoCmpl),
            3 => Some(Self::FsMeta),
            4 => Some(Self::FsFileName),
            5 => Some(Self::FsFileEvent),
            6 => Some(Self::Padding),
            _ => None,
        }
    }
}

/// Common header prefixing every record in a per-CPU ring.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordHeader {
    pub version_major: u8,
    pub version_minor: u8,
    pub type_: u16,
    pub size: u32,
    pub seq_id: u64,
    pub timestamp_ns: u64,
}

impl RecordHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub const fn new(type_: RecordType, size: u32, seq_id: u64, timestamp_ns: u64) -> Self {
        Self {
            version_major: PROTOCOL_VERSION_MAJOR,
            version_minor: PROTOCOL_VERSION_MINOR,
            type_: type_ as u16,
            size,
            seq_id,
            timestamp_ns,
        }
    }

    pub const fn zeroed() -> Self {
        Self {
            version_major: 0,
            version_minor: 0,
            type_: 0,
            size: 0,
            seq_id: 0,
            timestamp_ns: 0,
        }
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u16(self.type_)
    }
}

/// `device_desc` body: announces a traced device to a CPU's ring before any
/// `io` record referencing it.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceDescBody {
    pub dev_id: u64,
    pub size_sectors: u64,
    pub name: [u8; 32],
    pub model: [u8; 64],
}

impl core::fmt::Debug for DeviceDescBody {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceDescBody")
            .field("dev_id", &self.dev_id)
            .field("size_sectors", &self.size_sectors)
            .field("name", &trim_cstr(&self.name))
            .field("model", &trim_cstr(&self.model))
            .finish()
    }
}

fn trim_cstr(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("<invalid utf8>")
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum IoOperation {
    Read = 0,
    Write = 1,
    Discard = 2,
}

/// Bitset carried in `io.flags`. Mirrors the original tracer's per-bio
/// classification: which of flush/fua/direct/metadata/readahead apply.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct IoFlags(pub u16);

impl IoFlags {
    pub const FLUSH: u16 = 1 << 0;
    pub const FUA: u16 = 1 << 1;
    pub const DIRECT: u16 = 1 << 2;
    pub const METADATA: u16 = 1 << 3;
    pub const READAHEAD: u16 = 1 << 4;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    pub fn insert(&mut self, flag: u16) {
        self.0 |= flag;
    }
}

/// `io` body: one per queued bio/request. Field order keeps the wire
/// layout from §3 (id/lba/len/dev) intact; `_pad0..2` are explicit stand-ins
/// for the interior alignment gaps `repr(C)` would otherwise leave, which
/// `bytemuck`'s `Pod` derive refuses to paper over.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct IoBody {
    pub id: u64,
    pub lba: u64,
    pub len_sectors: u32,
    pub _pad0: u32,
    pub dev_id: u64,
    pub operation: u8,
    pub _pad1: u8,
    pub flags: u16,
    pub write_hint: u8,
    pub _pad2: u8,
    pub io_class: u16,
}

/// `io_cmpl` body: one per completed bio/request.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct IoCmplBody {
    pub ref_id: u64,
    pub lba: u64,
    pub len_sectors: u32,
    pub _pad0: u32,
    pub dev_id: u64,
    pub error: i32,
    pub _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct CTime {
    pub sec: i64,
    pub nsec: u32,
    pub _pad: u32,
}

/// `fs_meta` body: filesystem enrichment attached to the immediately
/// preceding `io` record on the same CPU.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct FsMetaBody {
    pub ref_id: u64,
    pub partition_id: u64,
    pub file_ino: u64,
    pub file_ctime: CTime,
    pub file_offset_sectors: u64,
    pub file_size_sectors: u64,
}

pub const FS_FILE_NAME_MAX: usize = 255;

/// `fs_file_name` body: one ancestor-path component, emitted while walking
/// the dentry chain to the root (cache-suppressed on repeat).
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct FsFileNameBody {
    pub partition_id: u64,
    pub file_id: u64,
    pub parent_file_id: u64,
    pub name_len: u16,
    pub _pad: [u8; 6],
    pub file_name: [u8; FS_FILE_NAME_MAX],
    pub _pad_tail: u8,
}

impl core::fmt::Debug for FsFileNameBody {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let len = (self.name_len as usize).min(FS_FILE_NAME_MAX);
        f.debug_struct("FsFileNameBody")
            .field("partition_id", &self.partition_id)
            .field("file_id", &self.file_id)
            .field("parent_file_id", &self.parent_file_id)
            .field(
                "file_name",
                &core::str::from_utf8(&self.file_name[..len]).unwrap_or("<invalid utf8>"),
            )
            .finish()
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum FileEventKind {
    Create = 0,
    Delete = 1,
    MoveFrom = 2,
    MoveTo = 3,
}

/// `fs_file_event` body: lifecycle notification from the FS-event monitor.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct FsFileEventBody {
    pub dev_id: u64,
    pub file_id: u64,
    pub parent_id: u64,
    pub kind: u8,
    pub _pad: [u8; 7],
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn header_is_24_bytes() {
        assert_eq!(size_of::<RecordHeader>(), 24);
    }

    #[test]
    fn bodies_are_8_byte_aligned_sized() {
        assert_eq!(size_of::<DeviceDescBody>() % 8, 0);
        assert_eq!(size_of::<IoBody>() % 8, 0);
        assert_eq!(size_of::<IoCmplBody>() % 8, 0);
        assert_eq!(size_of::<FsMetaBody>() % 8, 0);
        assert_eq!(size_of::<FsFileNameBody>() % 8, 0);
        assert_eq!(size_of::<FsFileEventBody>() % 8, 0);
    }

    #[test]
    fn record_type_roundtrip() {
        for t in [
            RecordType::DeviceDesc,
            RecordType::Io,
            RecordType::IoCmpl,
            RecordType::FsMeta,
            RecordType::FsFileName,
            RecordType::FsFileEvent,
            RecordType::Padding,
        ] {
            assert_eq!(RecordType::from_u16(t as u16), Some(t));
        }
        assert_eq!(RecordType::from_u16(255), None);
    }

    #[test]
    fn io_flags_bitset() {
        let mut f = IoFlags::empty();
        assert!(!f.contains(IoFlags::FUA));
        f.insert(IoFlags::FUA);
        f.insert(IoFlags::FLUSH);
        assert!(f.contains(IoFlags::FUA));
        assert!(f.contains(IoFlags::FLUSH));
        assert!(!f.contains(IoFlags::DIRECT));
    }
}
