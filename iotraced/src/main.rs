use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aya::maps::{Array, MapData, PerCpuArray, PerCpuValues};
use aya::programs::{KProbe, TracePoint};
use aya::util::online_cpus;
use aya::{Ebpf, EbpfLoader, Pod};
use aya_log::EbpfLogger;
use caps::{CapSet, Capability};
use log::{info, warn};
use memmap2::MmapOptions;
use tokio::signal::unix::{SignalKind, signal};

use iotraced::api::{AppState, all_routes};
use iotraced::config::Config;
use iotraced::handler::{JsonlSink, SinkList};
use iotraced::metrics::Metrics;
use iotraced::registry::DeviceRegistry;
use iotraced::ring::RingConsumer;

mod runtime_ring;
use runtime_ring::drain_loop;

/// Mirrors `iotrace-ebpf::program::DeviceSlot` bit-for-bit; kept local since
/// the eBPF crate can't be a dependency of this one (it only builds for the
/// `bpf` target).
#[repr(C)]
#[derive(Copy, Clone)]
struct DeviceSlot {
    dev_id: u64,
    active: u8,
    _pad: [u8; 7],
}

unsafe impl Pod for DeviceSlot {}

const TRACER_STATE_RUNNING: u32 = 3;
const TRACER_STATE_DETACHING: u32 = 4;

fn ensure_environment() -> anyhow::Result<()> {
    check_capabilities()?;
    check_kernel_version(5, 8)?;
    Ok(())
}

fn check_capabilities() -> anyhow::Result<()> {
    let required = [
        Capability::CAP_BPF,
        Capability::CAP_PERFMON,
        Capability::CAP_SYS_ADMIN,
    ];
    for cap in &required {
        let has_cap = caps::has_cap(None, CapSet::Effective, *cap)
            .with_context(|| format!("failed to query capability {cap:?}"))?;
        if !has_cap {
            anyhow::bail!(
                "missing {:?} capability. Grant it with `sudo setcap cap_bpf,cap_perfmon,cap_sys_admin+ep $(command -v iotraced)` and restart.",
                cap
            );
        }
    }
    Ok(())
}

fn check_kernel_version(min_major: u32, min_minor: u32) -> anyhow::Result<()> {
    let release = std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .context("failed to read /proc/sys/kernel/osrelease")?;
    let version =
        parse_kernel_version(&release).context("unable to parse kernel release string")?;
    if version < (min_major, min_minor) {
        anyhow::bail!(
            "kernel {}.{} lacks the block/fs tracepoints this daemon needs; require >= {min_major}.{min_minor}",
            version.0,
            version.1,
        );
    }
    Ok(())
}

fn parse_kernel_version(raw: &str) -> Option<(u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

fn read_bpf_bytes() -> anyhow::Result<(Vec<u8>, String)> {
    const CANDIDATES: [&str; 6] = [
        "/usr/local/share/iotrace/iotrace-ebpf",
        "/usr/local/share/iotrace/iotrace-ebpf.o",
        "target/bpfel-unknown-none/release/iotrace-ebpf",
        "./target/bpfel-unknown-none/release/iotrace-ebpf",
        "../target/bpfel-unknown-none/release/iotrace-ebpf",
        "../../target/bpfel-unknown-none/release/iotrace-ebpf",
    ];
    if let Ok(path) = std::env::var("IOTRACE_BPF_PATH") {
        let data = std::fs::read(&path)?;
        return Ok((data, path));
    }
    for candidate in CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok((std::fs::read(candidate)?, candidate.to_string()));
        }
    }
    anyhow::bail!("eBPF object not found. Set IOTRACE_BPF_PATH or install to /usr/local/share/iotrace/")
}

fn attach_tracepoint(bpf: &mut Ebpf, program: &str, category: &str, name: &str) -> anyhow::Result<()> {
    let tp: &mut TracePoint = bpf
        .program_mut(program)
        .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
        .try_into()?;
    tp.load()?;
    tp.attach(category, name)?;
    Ok(())
}

fn attach_kprobe_optional(bpf: &mut Ebpf, program: &str, symbol: &str) {
    let result = (|| -> anyhow::Result<()> {
        let probe: &mut KProbe = bpf
            .program_mut(program)
            .ok_or_else(|| anyhow::anyhow!("{program} program not found"))?
            .try_into()?;
        probe.load()?;
        probe.attach(symbol, 0)?;
        Ok(())
    })();
    if let Err(err) = result {
        warn!("optional kprobe {symbol} ({program}) not attached: {err:?}");
    }
}

/// Loads and attaches every program this daemon needs. The returned
/// `EbpfLogger` must stay alive for `aya_log_ebpf::info!` calls in the
/// kernel program to keep reaching userspace; callers hold onto it for the
/// daemon's lifetime even though nothing reads it directly.
fn init_ebpf(bpf_bytes: &[u8]) -> anyhow::Result<(Ebpf, Option<EbpfLogger>)> {
    let mut loader = EbpfLoader::new();
    let mut bpf = loader.load(bpf_bytes)?;

    let logger = match EbpfLogger::init(&mut bpf) {
        Ok(logger) => {
            info!("eBPF logger initialized");
            Some(logger)
        }
        Err(e) => {
            warn!("eBPF logger not active: {e}");
            None
        }
    };

    attach_tracepoint(&mut bpf, "trace_block_queue", "block", "block_bio_queue")?;
    attach_tracepoint(&mut bpf, "trace_block_complete", "block", "block_rq_complete")?;
    attach_kprobe_optional(&mut bpf, "trace_vfs_write", "vfs_write");
    attach_kprobe_optional(&mut bpf, "trace_vfs_unlink", "vfs_unlink");
    attach_kprobe_optional(&mut bpf, "trace_vfs_rename", "vfs_rename");

    Ok((bpf, logger))
}

fn page_size() -> usize {
    procfs::page_size() as usize
}

/// mmap one CPU's slice of a `BPF_F_MMAPABLE` per-cpu array map. The kernel
/// rounds each CPU's copy up to a page boundary before laying the next one
/// out, so the stride between CPUs is `round_up(value_size, PAGE_SIZE)`, not
/// `value_size` itself.
fn mmap_percpu_slot(map: &MapData, value_size: usize, cpu: usize) -> anyhow::Result<memmap2::MmapMut> {
    let page = page_size();
    let stride = value_size.div_ceil(page) * page;
    let raw_fd = map.fd().as_raw_fd();
    let dup_fd = unsafe { libc::dup(raw_fd) };
    if dup_fd < 0 {
        anyhow::bail!(
            "dup failed for RING_REGION map fd: {}",
            std::io::Error::last_os_error()
        );
    }
    let file = unsafe { std::fs::File::from_raw_fd(dup_fd) };
    let mmap = unsafe {
        MmapOptions::new()
            .offset((stride * cpu) as u64)
            .len(value_size)
            .map_mut(&file)?
    };
    Ok(mmap)
}

fn resolve_dev(path: &str) -> anyhow::Result<(u32, u32)> {
    let meta = std::fs::metadata(path).with_context(|| format!("stat {path}"))?;
    let rdev = meta.rdev();
    let major = libc::major(rdev);
    let minor = libc::minor(rdev);
    Ok((major, minor))
}

/// Push every registered device into the kernel's per-CPU device mirror so
/// the hot-path tracepoints see it without crossing CPUs.
fn broadcast_devices(
    bpf: &mut Ebpf,
    devices: &DeviceRegistry,
    num_cpus: usize,
) -> anyhow::Result<()> {
    let map = bpf
        .take_map("DEVICE_REGISTRY")
        .ok_or_else(|| anyhow::anyhow!("DEVICE_REGISTRY map not found"))?;
    let mut registry: PerCpuArray<_, DeviceSlot> = PerCpuArray::try_from(map)?;

    for (idx, device) in devices.list().iter().enumerate() {
        let slot = DeviceSlot {
            dev_id: device.dev_id,
            active: 1,
            _pad: [0; 7],
        };
        let values = PerCpuValues::try_from(vec![slot; num_cpus])
            .map_err(|e| anyhow::anyhow!("building per-cpu device slot failed: {e}"))?;
        registry.set(idx as u32, values, 0)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    info!("starting iotraced");

    ensure_environment()?;

    let config = Config::load();
    let metrics = Arc::new(Metrics::new());
    let devices = Arc::new(DeviceRegistry::new());

    for path in &config.devices.trace {
        match resolve_dev(path) {
            Ok((major, minor)) => match devices.add(path, major, minor) {
                Ok(_) => info!("tracing {path} ({major}:{minor})"),
                Err(err) => warn!("failed to register {path}: {err}"),
            },
            Err(err) => warn!("failed to resolve device for {path}: {err}"),
        }
    }
    metrics.set_active_devices(devices.len());

    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                metrics.rollup();
            }
        });
    }

    let cpus = online_cpus().map_err(|(_, e)| e)?;
    let (bpf_bytes, chosen_path) = read_bpf_bytes()?;
    info!("using eBPF object: {chosen_path}");
    let (mut bpf, _logger) = init_ebpf(&bpf_bytes)?;

    broadcast_devices(&mut bpf, &devices, cpus.len())?;

    {
        let map = bpf
            .take_map("TRACER_STATE")
            .ok_or_else(|| anyhow::anyhow!("TRACER_STATE map not found"))?;
        let mut state: Array<_, u32> = Array::try_from(map)?;
        state.set(0, TRACER_STATE_RUNNING, 0)?;
    }

    let ring_map = bpf
        .take_map("RING_REGION")
        .ok_or_else(|| anyhow::anyhow!("RING_REGION map not found"))?;

    let sinks = {
        let mut list = SinkList::new();
        match JsonlSink::new(&config.logging.sink_path).await {
            Ok(sink) => list.register(sink),
            Err(err) => warn!(
                "failed to open sink {}: {err}",
                config.logging.sink_path
            ),
        }
        Arc::new(list)
    };

    let app_state = Arc::new(AppState::new(
        Arc::clone(&devices),
        Arc::clone(&metrics),
        config.ring.size_mb,
    ));

    for (idx, _cpu) in cpus.iter().enumerate() {
        let mmap = mmap_percpu_slot(&ring_map, iotrace_common::RING_REGION_BYTES, idx)?;
        let consumer = RingConsumer::new(idx, mmap);
        tokio::spawn(drain_loop(
            consumer,
            Arc::clone(&sinks),
            Arc::clone(&metrics),
            Arc::clone(&app_state),
        ));
    }

    let listener = tokio::net::TcpListener::bind(&config.control.listen_addr).await?;
    info!("control surface on http://{}", config.control.listen_addr);
    let router = all_routes(Arc::clone(&app_state));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            warn!("control surface exited: {err}");
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("ctrl-c received, shutting down"),
        _ = sigterm.recv() => info!("sigterm received, shutting down"),
    }

    if let Some(map) = bpf.take_map("TRACER_STATE") {
        if let Ok(mut state) = Array::<_, u32>::try_from(map) {
            let _ = state.set(0, TRACER_STATE_DETACHING, 0);
        }
    }

    Ok(())
}
