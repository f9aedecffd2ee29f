#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

use bytemuck::{Pod, Zeroable};

/// Number of syscall slots tracked per mount namespace. Large enough to cover
/// every syscall number on both arm64 and x86_64 with headroom for growth.
pub const MAX_SYSCALLS: usize = 512;

/// A mount namespace's observed-syscalls bitmap: byte `i` is 1 iff syscall
/// number `i` has been seen at least once for that namespace.
pub type SyscallBitmap = [u8; MAX_SYSCALLS];

/// An attribution record pushed from the kernel program to userspace for
/// every syscall entry that was newly recorded (or that matches the
/// configured executable filter).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SyscallEvent {
    pub pid: u32,
    pub mntns: u32,
}

/// Mount-namespace field offsets discovered from kernel BTF at startup and
/// handed to the kernel program as a global so it can read
/// `task_struct -> nsproxy -> mnt_ns -> ns_common.inum` without hardcoding
/// layout that varies across kernel builds.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryConfig {
    /// Offset of `tgid` in `task_struct` (the userspace-visible pid).
    pub task_tgid_offset: u32,
    /// Offset of `comm` (16 bytes) in `task_struct`.
    pub task_comm_offset: u32,
    /// Offset of `nsproxy` (a pointer) in `task_struct`.
    pub task_nsproxy_offset: u32,
    /// Offset of `mnt_ns` (a pointer) in `struct nsproxy`.
    pub nsproxy_mnt_ns_offset: u32,
    /// Offset of the embedded `struct ns_common` in `struct mnt_namespace`.
    pub mnt_ns_ns_common_offset: u32,
    /// Offset of `inum` in `struct ns_common`.
    pub ns_common_inum_offset: u32,
    pub _pad: u32,
}

impl TelemetryConfig {
    pub const fn zeroed() -> Self {
        Self {
            task_tgid_offset: 0,
            task_comm_offset: 0,
            task_nsproxy_offset: 0,
            nsproxy_mnt_ns_offset: 0,
            mnt_ns_ns_common_offset: 0,
            ns_common_inum_offset: 0,
            _pad: 0,
        }
    }
}

#[cfg(feature = "user")]
#[allow(dead_code)]
fn assert_telemetry_config_traits() {
    fn assert_traits<T: Pod + Zeroable>() {}
    assert_traits::<TelemetryConfig>();
    assert_traits::<SyscallEvent>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn syscall_event_is_8_bytes() {
        assert_eq!(size_of::<SyscallEvent>(), 8);
    }

    #[test]
    fn bitmap_length_matches_constant() {
        let bitmap: SyscallBitmap = [0u8; MAX_SYSCALLS];
        assert_eq!(bitmap.len(), MAX_SYSCALLS);
    }

    #[cfg(feature = "user")]
    #[test]
    fn syscall_event_roundtrip() {
        let event = SyscallEvent {
            pid: 1234,
            mntns: 4026532001,
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: SyscallEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.pid, event.pid);
        assert_eq!(back.mntns, event.mntns);
    }
}
