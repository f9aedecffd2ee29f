//! Event ingestor (C2): drains the `events` ring buffer and attributes
//! each `(pid, mntns)` record to a container/profile, bounded to at most
//! 1000 in-flight per-event tasks.

use std::sync::Arc;

use aya::maps::{MapData, ring_buf::RingBuf};
use log::{debug, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::Semaphore;

use crate::state::AppState;

/// Weighted semaphore bound on concurrent per-event tasks (§4.2, §5).
pub const MAX_IN_FLIGHT_EVENTS: usize = 1000;

fn decode_record(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 8 {
        return None;
    }
    let pid = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let mntns = u32::from_le_bytes(data[4..8].try_into().ok()?);
    Some((pid, mntns))
}

/// Spawns the draining loop as a background task and returns its handle
/// so the recording controller can cancel it on `Unload`.
pub fn spawn(ringbuf: RingBuf<MapData>, state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = run(ringbuf, state).await {
            warn!("event ingestor stopped: {err}");
        }
    })
}

async fn run(ringbuf: RingBuf<MapData>, state: Arc<AppState>) -> anyhow::Result<()> {
    let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT_EVENTS));
    let mut poll = match AsyncFd::new(ringbuf) {
        Ok(poll) => poll,
        Err(err) => {
            state.metrics.inc_ring_buffer_error();
            return Err(err.into());
        }
    };

    loop {
        let mut guard = match poll.readable_mut().await {
            Ok(guard) => guard,
            Err(err) => {
                state.metrics.inc_ring_buffer_error();
                return Err(err.into());
            }
        };
        let ring = guard.get_inner_mut();
        while let Some(item) = ring.next() {
            let Some((pid, mntns)) = decode_record(&item) else {
                debug!("dropped malformed ring buffer record of len {}", item.len());
                state.metrics.inc_dropped_malformed();
                continue;
            };

            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!("event ingestor semaphore closed; stopping");
                    return Ok(());
                }
            };

            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let _permit = permit;
                state.handle_event(pid, mntns).await;
            });
        }
        guard.clear_ready();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_pid_mntns() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1001u32.to_le_bytes());
        bytes.extend_from_slice(&4026532001u32.to_le_bytes());
        assert_eq!(decode_record(&bytes), Some((1001, 4026532001)));
    }

    #[test]
    fn short_record_is_rejected() {
        assert_eq!(decode_record(&[1, 2, 3]), None);
    }
}
