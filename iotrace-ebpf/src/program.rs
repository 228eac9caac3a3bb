use aya_ebpf::{
    helpers::{bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_kernel_buf},
    macros::{kprobe, map, tracepoint},
    maps::{Array, LruHashMap, PerCpuArray},
    programs::{ProbeContext, TracePointContext},
};
use aya_log_ebpf::info;
use iotrace_common::{
    classify_file_size_class, device::encode_dev_id, event::{
        DeviceDescBody, FileEventKind, FsFileEventBody, FsFileNameBody, FsMetaBody, IoBody,
        IoCmplBody, IoFlags, IoOperation, RecordHeader, RecordType, FS_FILE_NAME_MAX,
    },
    ioclass::IoClass,
    ring::{Producer, RingHeader},
    MAX_TRACED_DEVICES, RING_DATA_BYTES, RING_HEADER_BYTES, RING_REGION_BYTES,
};

// =============================================================================
// Tracer state machine (Idle -> Loaded -> Attached -> Running -> Detaching)
// =============================================================================

#[repr(u32)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub enum TracerState {
    Idle = 0,
    Loaded = 1,
    Attached = 2,
    Running = 3,
    Detaching = 4,
}

#[map(name = "TRACER_STATE")]
static mut TRACER_STATE: Array<u32> = Array::with_max_entries(1, 0);

fn tracer_is_running() -> bool {
    unsafe { TRACER_STATE.get(0).copied() == Some(TracerState::Running as u32) }
}

// =============================================================================
// Device registry - per-CPU mirror, broadcast-updated by userspace on
// add_device/remove_device so the hot path never crosses CPUs to check
// whether a bio's device is being traced.
// =============================================================================

#[repr(C)]
#[derive(Copy, Clone)]
struct DeviceSlot {
    dev_id: u64,
    active: u8,
    _pad: [u8; 7],
}

#[map(name = "DEVICE_REGISTRY")]
static mut DEVICE_REGISTRY: PerCpuArray<DeviceSlot> =
    PerCpuArray::with_max_entries(MAX_TRACED_DEVICES as u32, 0);

fn device_is_traced(dev_id: u64) -> bool {
    for i in 0..MAX_TRACED_DEVICES as u32 {
        if let Some(slot) = unsafe { DEVICE_REGISTRY.get(i) } {
            if slot.active != 0 && slot.dev_id == dev_id {
                return true;
            }
        }
    }
    false
}

// =============================================================================
// Inode name cache - bounded LRU keyed by (dev_id, inode). A hit means the
// consumer side already has this file's path; a miss means we still owe it
// an `fs_file_name` record before the next `fs_meta` referencing it.
// =============================================================================

#[repr(C)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
struct InodeKey {
    dev_id: u64,
    inode: u64,
}

#[map(name = "INODE_NAME_CACHE")]
static mut INODE_NAME_CACHE: LruHashMap<InodeKey, u8> = LruHashMap::with_max_entries(4096, 0);

fn inode_name_known(dev_id: u64, inode: u64) -> bool {
    let key = InodeKey { dev_id, inode };
    unsafe { INODE_NAME_CACHE.get(&key).is_some() }
}

fn inode_name_mark_known(dev_id: u64, inode: u64) {
    let key = InodeKey { dev_id, inode };
    let _ = unsafe { INODE_NAME_CACHE.insert(&key, &1u8, 0) };
}

// =============================================================================
// Per-CPU trace ring - one BPF_F_MMAPABLE PerCpuArray slot per online CPU.
// Each CPU's copy is laid out as [RingHeader][data bytes], matching
// `iotrace_common::ring`'s expectations: header written through atomics,
// data written before the header's producer_pos publish.
// =============================================================================

const BPF_F_MMAPABLE: u32 = 1024;

#[repr(C, align(8))]
struct RingRegion {
    bytes: [u8; RING_REGION_BYTES],
}

#[map(name = "RING_REGION")]
static mut RING_REGION: PerCpuArray<RingRegion> = PerCpuArray::with_max_entries(1, BPF_F_MMAPABLE);

#[map(name = "SEQ_ID")]
static mut SEQ_ID: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

fn next_seq_id() -> u64 {
    unsafe {
        match SEQ_ID.get_ptr_mut(0) {
            Some(ptr) => {
                let next = (*ptr).wrapping_add(1);
                *ptr = next;
                next
            }
            None => 0,
        }
    }
}

/// Deterministic id for an `(dev_id, sector)` request, shared by its `io` and
/// `io_cmpl` records. Plain ftrace tracepoints don't expose a stable bio
/// pointer across queue/complete, so pair them the way blktrace pairs its Q
/// and C events: by device and starting sector.
fn request_id(dev_id: u64, sector: u64) -> u64 {
    let mut x = dev_id ^ sector.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

// =============================================================================
// Last-queued-io scratch - bridges block_bio_queue and vfs_write on the same
// CPU so the fs-enrichment probe knows which io to attach fs_meta to.
// =============================================================================

#[repr(C)]
#[derive(Copy, Clone)]
struct LastIo {
    io_id: u64,
    dev_id: u64,
    valid: u8,
    _pad: [u8; 7],
}

#[map(name = "LAST_IO")]
static mut LAST_IO: PerCpuArray<LastIo> = PerCpuArray::with_max_entries(1, 0);

fn stash_last_io(io_id: u64, dev_id: u64) {
    unsafe {
        if let Some(ptr) = LAST_IO.get_ptr_mut(0) {
            *ptr = LastIo {
                io_id,
                dev_id,
                valid: 1,
                _pad: [0; 7],
            };
        }
    }
}

fn take_last_io() -> Option<(u64, u64)> {
    unsafe {
        let ptr = LAST_IO.get_ptr_mut(0)?;
        if (*ptr).valid == 0 {
            return None;
        }
        (*ptr).valid = 0;
        Some(((*ptr).io_id, (*ptr).dev_id))
    }
}

/// Borrow this CPU's ring region as a `(header, data)` pair. Returns `None`
/// if the map lookup fails (should not happen once attached) or the region
/// hasn't been initialized by userspace yet.
fn current_ring() -> Option<(&'static RingHeader, &'static mut [u8])> {
    let region_ptr = unsafe { RING_REGION.get_ptr_mut(0) }?;
    let base = region_ptr as *mut u8;
    let header = unsafe { &*(base as *const RingHeader) };
    if !header.is_valid() {
        return None;
    }
    let data = unsafe { core::slice::from_raw_parts_mut(base.add(RING_HEADER_BYTES), RING_DATA_BYTES) };
    Some((header, data))
}

fn emit_record(type_: RecordType, body: &[u8]) {
    let Some((header, data)) = current_ring() else {
        return;
    };
    let mut producer = unsafe { Producer::new(header, data) };
    let Some(res) = producer.reserve(body.len()) else {
        return;
    };
    let now = unsafe { bpf_ktime_get_ns() };
    let seq = next_seq_id();
    let rec_header = RecordHeader::new(type_, body.len() as u32, seq, now);
    producer.commit(res, rec_header, body);
}

// =============================================================================
// Block layer tracepoints
// =============================================================================

const BLOCK_BIO_DEV_OFFSET: usize = 0;
const BLOCK_BIO_SECTOR_OFFSET: usize = 8;
const BLOCK_BIO_NR_SECTOR_OFFSET: usize = 16;
const BLOCK_BIO_OP_OFFSET: usize = 20;

const BLOCK_RQ_DEV_OFFSET: usize = 0;
const BLOCK_RQ_SECTOR_OFFSET: usize = 8;
const BLOCK_RQ_NR_SECTOR_OFFSET: usize = 16;

// enum req_op / enum req_flag_bits, from the block layer's bi_opf/cmd_flags.
const REQ_OP_BITS: u32 = 8;
const REQ_OP_MASK: u32 = (1 << REQ_OP_BITS) - 1;
const REQ_OP_READ: u32 = 0;
const REQ_OP_FLUSH: u32 = 2;
const REQ_OP_DISCARD: u32 = 3;
const REQ_META: u32 = 1 << 12;
const REQ_FUA: u32 = 1 << 16;
const REQ_PREFLUSH: u32 = 1 << 17;
const REQ_RAHEAD: u32 = 1 << 18;

/// Derive operation/class/flags from a bio's `bi_opf`, the way bcc's
/// biosnoop-style tracers classify block io without walking the page cache.
fn classify_io(raw_flags: u32, bytes: u64) -> (IoOperation, IoClass, IoFlags) {
    let op = raw_flags & REQ_OP_MASK;
    let operation = match op {
        REQ_OP_READ => IoOperation::Read,
        REQ_OP_DISCARD => IoOperation::Discard,
        _ => IoOperation::Write,
    };
    let io_class = if raw_flags & REQ_META != 0 {
        IoClass::Metadata
    } else {
        classify_file_size_class(bytes)
    };

    let mut flags = IoFlags::empty();
    if raw_flags & REQ_FUA != 0 {
        flags.insert(IoFlags::FUA);
    }
    if op == REQ_OP_FLUSH || raw_flags & REQ_PREFLUSH != 0 {
        flags.insert(IoFlags::FLUSH);
    }
    if raw_flags & REQ_RAHEAD != 0 {
        flags.insert(IoFlags::READAHEAD);
    }
    if io_class == IoClass::Metadata {
        flags.insert(IoFlags::METADATA);
    }
    (operation, io_class, flags)
}

const DEVICE_MAJOR_BITS: u32 = 12;
const DEVICE_MINOR_BITS: u32 = 20;
const DEVICE_MAJOR_MASK: u64 = (1u64 << DEVICE_MAJOR_BITS) - 1;
const DEVICE_MINOR_MASK: u64 = (1u64 << DEVICE_MINOR_BITS) - 1;
const BYTES_PER_SECTOR: u64 = 512;

fn tp_read_u64(ctx: &TracePointContext, offset: usize) -> Option<u64> {
    unsafe { ctx.read_at::<u64>(offset).ok() }
}

fn tp_read_u32(ctx: &TracePointContext, offset: usize) -> Option<u32> {
    unsafe { ctx.read_at::<u32>(offset).ok() }
}

/// Re-key a kernel `dev_t` (major in the high bits, minor in the low 20) to
/// our wire-format dev_id, which uses the same layout as
/// `iotrace_common::device::encode_dev_id` but reads it straight off the
/// kernel's packed representation instead of composing it from parts.
#[inline(always)]
fn normalize_dev(dev: u64) -> u64 {
    let major = ((dev >> DEVICE_MINOR_BITS) & DEVICE_MAJOR_MASK) as u32;
    let minor = (dev & DEVICE_MINOR_MASK) as u32;
    encode_dev_id(major, minor)
}

#[tracepoint(category = "block", name = "block_bio_queue")]
pub fn trace_block_queue(ctx: TracePointContext) -> u32 {
    try_trace_block_queue(ctx)
}

fn try_trace_block_queue(ctx: TracePointContext) -> u32 {
    if !tracer_is_running() {
        return 0;
    }
    let Some(dev) = tp_read_u64(&ctx, BLOCK_BIO_DEV_OFFSET) else {
        return 0;
    };
    let dev_id = normalize_dev(dev);
    if !device_is_traced(dev_id) {
        return 0;
    }
    let Some(sector) = tp_read_u64(&ctx, BLOCK_BIO_SECTOR_OFFSET) else {
        return 0;
    };
    let Some(sectors) = tp_read_u32(&ctx, BLOCK_BIO_NR_SECTOR_OFFSET) else {
        return 0;
    };
    if sectors == 0 {
        return 0;
    }
    let raw_flags = tp_read_u32(&ctx, BLOCK_BIO_OP_OFFSET).unwrap_or(0);

    let bytes = (sectors as u64) * BYTES_PER_SECTOR;
    let (operation, io_class, flags) = classify_io(raw_flags, bytes);

    let io_id = request_id(dev_id, sector);
    let body = IoBody {
        id: io_id,
        lba: sector,
        len_sectors: sectors,
        _pad0: 0,
        dev_id,
        operation: operation as u8,
        _pad1: 0,
        flags: flags.0,
        write_hint: 0,
        _pad2: 0,
        io_class: io_class as u16,
    };
    emit_record(RecordType::Io, bytemuck::bytes_of(&body));
    stash_last_io(io_id, dev_id);

    if io_class.is_data_file_bucket() {
        info!(&ctx, "queued data io, class {}", io_class as u16);
    }
    0
}

#[tracepoint(category = "block", name = "block_rq_complete")]
pub fn trace_block_complete(ctx: TracePointContext) -> u32 {
    try_trace_block_complete(ctx)
}

fn try_trace_block_complete(ctx: TracePointContext) -> u32 {
    if !tracer_is_running() {
        return 0;
    }
    let Some(dev) = tp_read_u64(&ctx, BLOCK_RQ_DEV_OFFSET) else {
        return 0;
    };
    let dev_id = normalize_dev(dev);
    if !device_is_traced(dev_id) {
        return 0;
    }
    let Some(sector) = tp_read_u64(&ctx, BLOCK_RQ_SECTOR_OFFSET) else {
        return 0;
    };
    let Some(sectors) = tp_read_u32(&ctx, BLOCK_RQ_NR_SECTOR_OFFSET) else {
        return 0;
    };

    let body = IoCmplBody {
        ref_id: request_id(dev_id, sector),
        lba: sector,
        len_sectors: sectors,
        _pad0: 0,
        dev_id,
        error: 0,
        _pad1: 0,
    };
    emit_record(RecordType::IoCmpl, bytemuck::bytes_of(&body));
    0
}

// =============================================================================
// Filesystem correlation - vfs_write attaches an fs_meta record to the
// immediately preceding io record on this CPU; vfs_unlink/vfs_rename raise
// fs_file_event lifecycle notifications.
// =============================================================================

// struct file / inode / dentry offsets for the pinned kernel this tracer
// targets. No BTF is available to this program (see DESIGN.md), so these
// are plain offsets rather than CO-RE relocations; a kernel config drift
// here needs a rebuild.
const FILE_F_INODE_OFFSET: usize = 16;
const FILE_F_PATH_DENTRY_OFFSET: usize = 24;
const FILE_F_POS_OFFSET: usize = 104;
const INODE_I_INO_OFFSET: usize = 64;
const INODE_I_SIZE_OFFSET: usize = 104;
const DENTRY_D_PARENT_OFFSET: usize = 24;
const DENTRY_D_INODE_OFFSET: usize = 32;
const DENTRY_D_NAME_LEN_OFFSET: usize = 40;
const DENTRY_D_NAME_NAME_OFFSET: usize = 48;
const MAX_DENTRY_DEPTH: u32 = 32;

fn read_u64(ptr: u64, offset: usize) -> Option<u64> {
    let addr = (ptr as usize).checked_add(offset)? as *const u64;
    unsafe { bpf_probe_read_kernel(addr).ok() }
}

fn read_u32(ptr: u64, offset: usize) -> Option<u32> {
    let addr = (ptr as usize).checked_add(offset)? as *const u32;
    unsafe { bpf_probe_read_kernel(addr).ok() }
}

#[kprobe(function = "vfs_write")]
pub fn trace_vfs_write(ctx: ProbeContext) -> u32 {
    try_trace_vfs_write(ctx)
}

fn try_trace_vfs_write(ctx: ProbeContext) -> u32 {
    if !tracer_is_running() {
        return 0;
    }
    let Some((io_id, dev_id)) = take_last_io() else {
        return 0;
    };
    let Some(file_ptr) = (unsafe { ctx.arg::<u64>(0) }) else {
        return 0;
    };
    emit_fs_context(file_ptr, dev_id, io_id);
    0
}

/// Attach filesystem context to the `io` identified by `ref_id`: always emit
/// `fs_meta`, and on a cache miss for this inode also walk the dentry chain
/// to the root emitting one `fs_file_name` per ancestor.
fn emit_fs_context(file_ptr: u64, dev_id: u64, ref_id: u64) {
    let Some(inode_ptr) = read_u64(file_ptr, FILE_F_INODE_OFFSET) else {
        return;
    };
    let Some(dentry_ptr) = read_u64(file_ptr, FILE_F_PATH_DENTRY_OFFSET) else {
        return;
    };
    let Some(inode) = read_u64(inode_ptr, INODE_I_INO_OFFSET) else {
        return;
    };
    let size_bytes = read_u64(inode_ptr, INODE_I_SIZE_OFFSET).unwrap_or(0);
    let pos_bytes = read_u64(file_ptr, FILE_F_POS_OFFSET).unwrap_or(0);

    let body = FsMetaBody {
        ref_id,
        partition_id: dev_id,
        file_ino: inode,
        file_ctime: iotrace_common::CTime {
            sec: 0,
            nsec: 0,
            _pad: 0,
        },
        file_offset_sectors: pos_bytes / BYTES_PER_SECTOR,
        file_size_sectors: size_bytes / BYTES_PER_SECTOR,
    };
    emit_record(RecordType::FsMeta, bytemuck::bytes_of(&body));

    if inode_name_known(dev_id, inode) {
        return;
    }
    inode_name_mark_known(dev_id, inode);
    emit_dentry_chain(dentry_ptr, dev_id, inode);
}

/// Walk the dentry chain from `leaf` to the filesystem root, emitting one
/// `fs_file_name` record per ancestor so userspace can reconstruct the path.
fn emit_dentry_chain(leaf: u64, partition_id: u64, file_id: u64) {
    let mut dentry = leaf;
    let mut child_id = file_id;
    for _ in 0..MAX_DENTRY_DEPTH {
        let Some(parent_ptr) = read_u64(dentry, DENTRY_D_PARENT_OFFSET) else {
            return;
        };
        if parent_ptr == dentry {
            return;
        }
        let Some(parent_inode_ptr) = read_u64(parent_ptr, DENTRY_D_INODE_OFFSET) else {
            return;
        };
        let Some(parent_id) = read_u64(parent_inode_ptr, INODE_I_INO_OFFSET) else {
            return;
        };
        let Some(name_ptr) = read_u64(dentry, DENTRY_D_NAME_NAME_OFFSET) else {
            return;
        };
        let Some(name_len) = read_u32(dentry, DENTRY_D_NAME_LEN_OFFSET) else {
            return;
        };
        let len = (name_len as usize).min(FS_FILE_NAME_MAX);

        let mut file_name = [0u8; FS_FILE_NAME_MAX];
        if unsafe { bpf_probe_read_kernel_buf(name_ptr as *const u8, &mut file_name[..len]) }
            .is_err()
        {
            return;
        }

        let body = FsFileNameBody {
            partition_id,
            file_id: child_id,
            parent_file_id: parent_id,
            name_len: len as u16,
            _pad: [0; 6],
            file_name,
            _pad_tail: 0,
        };
        emit_record(RecordType::FsFileName, bytemuck::bytes_of(&body));

        child_id = parent_id;
        dentry = parent_ptr;
    }
}

#[kprobe(function = "vfs_unlink")]
pub fn trace_vfs_unlink(ctx: ProbeContext) -> u32 {
    try_trace_file_event(ctx, FileEventKind::Delete)
}

#[kprobe(function = "vfs_rename")]
pub fn trace_vfs_rename(ctx: ProbeContext) -> u32 {
    try_trace_file_event(ctx, FileEventKind::MoveFrom)
}

fn try_trace_file_event(ctx: ProbeContext, kind: FileEventKind) -> u32 {
    if !tracer_is_running() {
        return 0;
    }
    let body = FsFileEventBody {
        dev_id: 0,
        file_id: 0,
        parent_id: 0,
        kind: kind as u8,
        _pad: [0; 7],
    };
    emit_record(RecordType::FsFileEvent, bytemuck::bytes_of(&body));
    let _ = &ctx;
    0
}

#[allow(dead_code)]
fn emit_device_desc(dev_id: u64, size_sectors: u64, name: [u8; 32], model: [u8; 64]) {
    let body = DeviceDescBody {
        dev_id,
        size_sectors,
        name,
        model,
    };
    emit_record(RecordType::DeviceDesc, bytemuck::bytes_of(&body));
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
