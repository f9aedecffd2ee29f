use std::collections::HashMap;
use std::sync::Mutex;

use procfs::process::Process;

/// Narrow capability over the host's view of a process's cgroup
/// membership, so the resolver can be tested without a real procfs.
pub trait CgroupReader: Send + Sync {
    fn read_cgroup(&self, pid: u32) -> std::io::Result<String>;
}

/// Reads a pid's cgroup membership through the `procfs` crate, the same way
/// the rest of this workspace reads procfs views of a process, and flattens
/// it back into the `hierarchy:controllers:pathname` line shape the
/// container-id regex is written against.
pub struct ProcfsCgroupReader;

impl CgroupReader for ProcfsCgroupReader {
    fn read_cgroup(&self, pid: u32) -> std::io::Result<String> {
        let process = Process::new(pid as i32)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string()))?;
        let cgroups = process
            .cgroups()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::NotFound, err.to_string()))?;
        let lines: Vec<String> = cgroups
            .into_iter()
            .map(|cg| format!("{}:{}:{}", cg.hierarchy, cg.controllers.join(","), cg.pathname))
            .collect();
        Ok(lines.join("\n"))
    }
}

/// In-memory fake keyed by pid, for tests.
pub struct FakeCgroupReader {
    entries: Mutex<HashMap<u32, String>>,
}

impl FakeCgroupReader {
    pub fn new(entries: HashMap<u32, String>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl CgroupReader for FakeCgroupReader {
    fn read_cgroup(&self, pid: u32) -> std::io::Result<String> {
        self.entries
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_reader_returns_not_found_for_unknown_pid() {
        let reader = FakeCgroupReader::new(HashMap::new());
        assert!(reader.read_cgroup(1).is_err());
    }
}
