//! Kernel-program loader (C1): selects BTF, loads and attaches the
//! `recorder` bytecode to `raw_syscalls:sys_enter`, and exposes the
//! `mntns_syscalls`/`pid_mntns` maps plus the `events` ring buffer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use aya::maps::{HashMap as AyaHashMap, MapData, ring_buf::RingBuf};
use aya::programs::TracePoint;
use aya::{Btf, Ebpf, EbpfLoader, Pod as AyaPod};
use log::info;
use recorder_ebpf_common::{SyscallBitmap, TelemetryConfig};

use crate::bpf_config::derive_telemetry_config;
use crate::ingestor;
use crate::state::AppState;

const KERNEL_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";
const MIN_KERNEL_MAJOR: u32 = 5;
const MIN_KERNEL_MINOR: u32 = 8;

#[repr(transparent)]
#[derive(Copy, Clone)]
struct TelemetryConfigPod(TelemetryConfig);
unsafe impl AyaPod for TelemetryConfigPod {}

/// Everything `load` hands back: the loaded/attached module (kept alive
/// for as long as the program should stay attached), the bitmap map used
/// by the drain path, and the event ingestor's task handle.
pub struct Loaded {
    _bpf: Ebpf,
    pub mntns_syscalls: AyaHashMap<MapData, u32, SyscallBitmap>,
    pub ingestor: Option<tokio::task::JoinHandle<()>>,
}

/// `(os-id, os-version-id, architecture, kernel-release) -> relative path
/// of a pre-fetched BTF blob`. Populated out of band (this crate does not
/// vendor kernel BTF blobs); an empty or partial table is fine — a miss
/// just means "proceed with no explicit type-info path" (§4.1).
fn embedded_btf_index() -> &'static [((&'static str, &'static str, &'static str, &'static str), &'static str)] {
    &[]
}

fn current_arch() -> &'static str {
    if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        "unknown"
    }
}

fn read_os_release_field(contents: &str, key: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if k == key {
            Some(v.trim_matches('"').to_string())
        } else {
            None
        }
    })
}

fn kernel_release() -> Result<String> {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .context("failed to read /proc/sys/kernel/osrelease")
}

/// Parses `X.Y` out of a release string, ignoring any `-xyz` pre-release
/// suffix, per the hard precondition in §4.1.
fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let version_part = release.split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

fn check_kernel_version() -> Result<()> {
    let release = kernel_release()?;
    let (major, minor) =
        parse_kernel_version(&release).ok_or_else(|| anyhow!("unparsable kernel release {release}"))?;
    if (major, minor) < (MIN_KERNEL_MAJOR, MIN_KERNEL_MINOR) {
        bail!(
            "kernel {major}.{minor} is older than the minimum supported {MIN_KERNEL_MAJOR}.{MIN_KERNEL_MINOR}"
        );
    }
    Ok(())
}

/// Resolves the BTF path to pass to the loader: the system blob if
/// present, otherwise an index lookup, otherwise none (§4.1).
fn select_btf_path(btf_override: Option<&str>) -> Result<Option<PathBuf>> {
    if let Some(path) = btf_override {
        return Ok(Some(PathBuf::from(path)));
    }
    if std::path::Path::new(KERNEL_BTF_PATH).is_file() {
        return Ok(None);
    }

    let os_release = std::fs::read_to_string("/etc/os-release").unwrap_or_default();
    let os_id = read_os_release_field(&os_release, "ID");
    let os_version = read_os_release_field(&os_release, "VERSION_ID");
    let release = kernel_release().ok();
    let arch = current_arch();

    let (Some(os_id), Some(os_version), Some(release)) = (os_id, os_version, release) else {
        return Ok(None);
    };

    let key = (os_id.as_str(), os_version.as_str(), arch, release.as_str());
    let Some((_, blob_path)) = embedded_btf_index().iter().find(|(k, _)| *k == key) else {
        return Ok(None);
    };

    let contents = std::fs::read(blob_path).with_context(|| format!("embedded BTF blob {blob_path} missing"))?;
    let mut tmp = tempfile::Builder::new()
        .prefix("syscapd-btf-")
        .tempfile()
        .context("failed to create temp file for BTF blob")?;
    std::io::Write::write_all(&mut tmp, &contents)?;
    let (_, path) = tmp.keep().context("failed to persist BTF temp file")?;
    Ok(Some(path))
}

fn locate_recorder_object(env_override: &str) -> Result<Vec<u8>> {
    if let Ok(path) = std::env::var(env_override) {
        return std::fs::read(&path).with_context(|| format!("failed to read {path}"));
    }
    const CANDIDATES: [&str; 6] = [
        "/usr/local/share/syscapd/recorder-ebpf-ebpf",
        "target/bpfel-unknown-none/release/recorder-ebpf-ebpf",
        "./target/bpfel-unknown-none/release/recorder-ebpf-ebpf",
        "../target/bpfel-unknown-none/release/recorder-ebpf-ebpf",
        "target/bpfeb-unknown-none/release/recorder-ebpf-ebpf",
        "../target/bpfeb-unknown-none/release/recorder-ebpf-ebpf",
    ];
    for candidate in CANDIDATES {
        if let Ok(bytes) = std::fs::read(candidate) {
            return Ok(bytes);
        }
    }
    bail!(
        "recorder eBPF object not found; set {env_override} or install under /usr/local/share/syscapd/"
    )
}

fn filter_name_bytes(filter_program_name: Option<&str>) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    if let Some(name) = filter_program_name {
        let name = name.as_bytes();
        let len = name.len().min(16);
        bytes[..len].copy_from_slice(&name[..len]);
    }
    bytes
}

/// Reads the system mount namespace of pid 1 by following
/// `/proc/1/ns/mnt`, a `mnt:[<inum>]` symlink (§6).
fn system_mntns() -> Result<u32> {
    let link = std::fs::read_link("/proc/1/ns/mnt").context("failed to read /proc/1/ns/mnt")?;
    let text = link.to_string_lossy();
    let inum = text
        .strip_prefix("mnt:[")
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| anyhow!("unexpected mnt namespace symlink format: {text}"))?;
    inum.parse().context("mount namespace id is not numeric")
}

/// Prepares, loads and attaches the `recorder` program, per §4.1.
/// When `start_event_processor` is true, also spawns the event ingestor
/// (C2) over the `events` ring buffer.
pub async fn load(
    bpf_object_env: &str,
    btf_override: Option<&str>,
    filter_program_name: Option<&str>,
    state: Arc<AppState>,
    start_event_processor: bool,
) -> Result<Loaded> {
    check_kernel_version()?;
    if current_arch() == "unknown" {
        bail!("unsupported architecture for the recorder eBPF program");
    }

    let btf_path = select_btf_path(btf_override)?;
    let telemetry_path = btf_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(KERNEL_BTF_PATH));
    let telemetry = derive_telemetry_config(&telemetry_path.to_string_lossy())
        .context("failed to derive mount-namespace field offsets from kernel BTF")?;

    let bytes = locate_recorder_object(bpf_object_env)?;

    let mut loader = EbpfLoader::new();
    loader.set_global("TELEMETRY_CONFIG", &TelemetryConfigPod(telemetry), true);
    loader.set_global("FILTER_NAME", &filter_name_bytes(filter_program_name), true);
    if let Some(path) = &btf_path {
        let endianness = if cfg!(target_endian = "little") {
            aya::Endianness::Little
        } else {
            aya::Endianness::Big
        };
        let btf = Btf::parse_file(path, endianness).context("failed to parse selected BTF blob")?;
        loader.btf(Some(&btf));
    }

    let mut bpf = loader.load(&bytes).context("failed to load recorder eBPF object")?;

    let tracepoint: &mut TracePoint = bpf
        .program_mut("trace_sys_enter")
        .ok_or_else(|| anyhow!("trace_sys_enter program not found in recorder object"))?
        .try_into()?;
    tracepoint.load()?;
    tracepoint.attach("raw_syscalls", "sys_enter")?;

    let mntns_syscalls: AyaHashMap<MapData, u32, SyscallBitmap> =
        AyaHashMap::try_from(bpf.take_map("MNTNS_SYSCALLS").ok_or_else(|| anyhow!("MNTNS_SYSCALLS map missing"))?)?;
    let mut pid_mntns: AyaHashMap<MapData, u32, u32> =
        AyaHashMap::try_from(bpf.take_map("PID_MNTNS").ok_or_else(|| anyhow!("PID_MNTNS map missing"))?)?;

    let system_mntns = system_mntns()?;
    pid_mntns.insert(1, system_mntns, 0)?;
    info!("recorder loaded; system mntns={system_mntns}");

    let ingestor = if start_event_processor {
        let ring_map = bpf
            .take_map("EVENTS")
            .ok_or_else(|| anyhow!("EVENTS ring buffer missing"))?;
        let ringbuf = RingBuf::try_from(ring_map)?;
        Some(ingestor::spawn(ringbuf, state))
    } else {
        None
    };

    // pid_mntns is read-only from userspace after seeding pid 1, so it does
    // not need to be kept around; dropping it here closes our handle while
    // the kernel program keeps using its own reference to the same map.
    drop(pid_mntns);

    Ok(Loaded {
        _bpf: bpf,
        mntns_syscalls,
        ingestor,
    })
}

/// Stops the event ingestor (if running) and drops the module and both map
/// handles, per the §9 design-notes fix for the source's "close a map"
/// bug: close the module, not a map.
pub fn unload(loaded: Loaded) {
    if let Some(handle) = loaded.ingestor {
        handle.abort();
    }
    // Dropping `loaded` here closes the module (detaching the tracepoint)
    // and releases the `mntns_syscalls` map handle.
    drop(loaded);
    info!("recorder unloaded");
}
