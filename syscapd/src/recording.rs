//! Recording controller (C5): a reference-counted start/stop gate that
//! loads the kernel program on the 0→1 transition and unloads it on the
//! 1→0 transition (§4.5).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use log::warn;
use tokio::sync::{Mutex, RwLock};

use crate::loader::{self, Loaded};
use crate::state::AppState;

pub struct RecordingController {
    count: AtomicU64,
    /// Serializes the compare-against-zero and the load/unload call, per
    /// §5 ("the simplest faithful implementation serializes Start/Stop").
    critical_section: Mutex<()>,
    /// Guards `(syscalls-map handle, module handle, btf temp file)`; the
    /// single reader/writer lock named in §5. Readers: the drain path's
    /// map reads. Writers: load, unload, and the drain path's key delete.
    pub loaded: RwLock<Option<Loaded>>,
    bpf_object_env: String,
    btf_override: Option<String>,
    filter_program_name: Option<String>,
}

impl RecordingController {
    pub fn new(bpf_object_env: String, btf_override: Option<String>, filter_program_name: Option<String>) -> Self {
        Self {
            count: AtomicU64::new(0),
            critical_section: Mutex::new(()),
            loaded: RwLock::new(None),
            bpf_object_env,
            btf_override,
            filter_program_name,
        }
    }

    pub fn is_running(&self) -> bool {
        self.count.load(Ordering::SeqCst) > 0
    }

    /// Increment-and-maybe-load. Loads only on the pre-increment value
    /// being 0, and only increments the counter once the load succeeds.
    pub async fn start(&self, state: Arc<AppState>) -> Result<()> {
        let _guard = self.critical_section.lock().await;
        if self.count.load(Ordering::SeqCst) == 0 {
            let loaded = loader::load(
                &self.bpf_object_env,
                self.btf_override.as_deref(),
                self.filter_program_name.as_deref(),
                state,
                true,
            )
            .await?;
            *self.loaded.write().await = Some(loaded);
        }
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Decrement-and-maybe-unload. A `Stop` while the counter is already
    /// 0 is a logged no-op that still returns success (§4.5).
    pub async fn stop(&self) {
        let _guard = self.critical_section.lock().await;
        if self.count.load(Ordering::SeqCst) == 0 {
            warn!("Stop called while no recording is active");
            return;
        }
        let after = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if after == 0 {
            if let Some(loaded) = self.loaded.write().await.take() {
                loader::unload(loaded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_controller_is_not_running() {
        let ctrl = RecordingController::new("SYSCAPD_BPF_PATH".to_string(), None, None);
        assert!(!ctrl.is_running());
    }
}
