//! Drain & report (C6): resolves a profile to its mount namespace, reads
//! and clears its kernel bitmap, and translates it into a sorted,
//! deduplicated set of syscall names (§4.6).

use log::warn;
use serde::Serialize;

use crate::error::RpcError;
use crate::identity::Backoff;
use crate::state::AppState;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SyscallsForProfile {
    pub syscalls: Vec<String>,
    pub go_arch: String,
}

fn architecture_tag() -> &'static str {
    std::env::consts::ARCH
}

pub async fn syscalls_for_profile(state: &AppState, name: &str) -> Result<SyscallsForProfile, RpcError> {
    if !state.recording.is_running() {
        return Err(RpcError::NotRunning);
    }

    let mntns = Backoff::MNTNS_LOOKUP
        .retry(|| async { state.associations.mntns_for_profile(name) })
        .await
        .ok_or(RpcError::NotFound)?;

    // Hold a single write lock across both the bitmap read and the delete
    // (§9 open-questions decision: option (a), avoiding the race where a
    // concurrent Unload invalidates the map handle between the two).
    let bitmap = {
        let mut guard = state.recording.loaded.write().await;
        let loaded = guard.as_mut().ok_or(RpcError::NotRunning)?;
        let bitmap = loaded
            .mntns_syscalls
            .get(&mntns, 0)
            .map_err(|_| RpcError::NoSyscallsForMntns)?;
        if let Err(err) = loaded.mntns_syscalls.remove(&mntns) {
            warn!("failed to delete bitmap entry for mntns {mntns}: {err}");
        }
        bitmap
    };

    let mut names = Vec::new();
    for (id, byte) in bitmap.iter().enumerate() {
        if *byte != 1 {
            continue;
        }
        match state.identity.syscall_name_cache.get_or_resolve(id as u32) {
            Some(name) => names.push(name),
            None => warn!("unresolvable syscall id {id}"),
        }
    }
    names.sort();
    names.dedup();

    state.associations.remove_profile(name);

    state.metrics.inc_profiles_drained();

    Ok(SyscallsForProfile {
        syscalls: names,
        go_arch: architecture_tag().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_tag_is_non_empty() {
        assert!(!architecture_tag().is_empty());
    }
}
