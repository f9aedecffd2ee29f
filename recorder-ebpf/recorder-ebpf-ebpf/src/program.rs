use aya_ebpf::{
    helpers::bpf_get_current_task_btf,
    helpers::bpf_probe_read,
    macros::{map, tracepoint},
    maps::{HashMap, RingBuf},
    programs::TracePointContext,
};
use recorder_ebpf_common::{SyscallBitmap, SyscallEvent, TelemetryConfig, MAX_SYSCALLS};

/// Per mount-namespace observed-syscalls bitmap. Keyed by the mount
/// namespace inode number (`ns_common.inum`), which is what userspace calls
/// the mount namespace id.
#[map(name = "MNTNS_SYSCALLS")]
static mut MNTNS_SYSCALLS: HashMap<u32, SyscallBitmap> = HashMap::with_max_entries(10_240, 0);

/// Last-seen mount namespace for a given pid. Seeded with `pid_mntns[1] =
/// <system mntns>` by userspace right after load so the kernel side never
/// has to special-case the host's own pid 1.
#[map(name = "PID_MNTNS")]
static mut PID_MNTNS: HashMap<u32, u32> = HashMap::with_max_entries(10_240, 0);

/// Attribution stream consumed by the userspace event ingestor.
#[map(name = "EVENTS")]
static EVENTS: RingBuf = RingBuf::with_byte_size(4096 * 1024, 0);

/// Optional exact-match filter on `task_struct.comm`; all-zero means
/// unfiltered. Populated by userspace before load when
/// `filter_program_name` is configured.
#[no_mangle]
static mut FILTER_NAME: [u8; 16] = [0; 16];

#[no_mangle]
static mut TELEMETRY_CONFIG: TelemetryConfig = TelemetryConfig::zeroed();

fn load_config() -> TelemetryConfig {
    unsafe { core::ptr::read_volatile(&TELEMETRY_CONFIG) }
}

fn load_filter() -> [u8; 16] {
    unsafe { core::ptr::read_volatile(&FILTER_NAME) }
}

fn filter_is_set(filter: &[u8; 16]) -> bool {
    filter.iter().any(|b| *b != 0)
}

fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
    if base.is_null() {
        return None;
    }
    let ptr = unsafe { base.add(offset as usize) as *const T };
    unsafe { bpf_probe_read(ptr).ok() }
}

fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr as *const u8)
    }
}

/// Walks `task_struct -> nsproxy -> mnt_ns -> ns_common.inum` using the
/// offsets BTF discovery handed us at load time. Returns `None` if any hop
/// in the chain is absent (e.g. the task is exiting and nsproxy was already
/// cleared).
fn current_mntns(task: *const u8, cfg: &TelemetryConfig) -> Option<u32> {
    let nsproxy = read_ptr(task, cfg.task_nsproxy_offset)?;
    let mnt_ns = read_ptr(nsproxy, cfg.nsproxy_mnt_ns_offset)?;
    let ns_common = unsafe { mnt_ns.add(cfg.mnt_ns_ns_common_offset as usize) };
    read_field(ns_common, cfg.ns_common_inum_offset)
}

fn set_bitmap_bit(mntns: u32, syscall_nr: u32) {
    if syscall_nr as usize >= MAX_SYSCALLS {
        return;
    }
    let map = unsafe { &MNTNS_SYSCALLS };
    if let Some(bitmap_ptr) = map.get_ptr_mut(&mntns) {
        let bitmap = unsafe { &mut *bitmap_ptr };
        bitmap[syscall_nr as usize] = 1;
    } else {
        let mut bitmap: SyscallBitmap = [0; MAX_SYSCALLS];
        bitmap[syscall_nr as usize] = 1;
        let _ = map.insert(&mntns, &bitmap, 0);
    }
}

#[tracepoint(category = "raw_syscalls", name = "sys_enter")]
pub fn trace_sys_enter(ctx: TracePointContext) -> u32 {
    try_trace_sys_enter(ctx).unwrap_or(0)
}

/// `raw_syscalls:sys_enter` format:
///   offset 0..8  common tracepoint header
///   offset 8     long id       (syscall number)
///   offset 16    unsigned long args[6]
fn try_trace_sys_enter(ctx: TracePointContext) -> Option<u32> {
    let syscall_nr: i64 = unsafe { ctx.read_at(8).ok()? };
    if syscall_nr < 0 {
        return Some(0);
    }

    let task = unsafe { bpf_get_current_task_btf() } as *const u8;
    let cfg = load_config();

    let filter = load_filter();
    if filter_is_set(&filter) {
        let comm: [u8; 16] = read_field(task, cfg.task_comm_offset).unwrap_or([0; 16]);
        if comm != filter {
            return Some(0);
        }
    }

    let pid: u32 = read_field(task, cfg.task_tgid_offset).unwrap_or(0);
    let mntns = current_mntns(task, &cfg)?;

    let pid_map = unsafe { &PID_MNTNS };
    let _ = pid_map.insert(&pid, &mntns, 0);

    set_bitmap_bit(mntns, syscall_nr as u32);

    let event = SyscallEvent { pid, mntns };
    let _ = EVENTS.output(&event, 0);

    Some(0)
}

#[cfg(all(not(test), target_arch = "bpf"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
