use moka::sync::Cache;
use std::time::Duration;

/// TTL + capacity bounded mapping from pid to container id. Entries expire
/// one hour after insertion and the table never holds more than `capacity`
/// live entries, per the data model's `PidToContainerCache`.
#[derive(Clone)]
pub struct PidToContainerCache {
    inner: Cache<u32, String>,
}

impl PidToContainerCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, pid: u32) -> Option<String> {
        self.inner.get(&pid)
    }

    pub fn insert(&self, pid: u32, container_id: String) {
        self.inner.insert(pid, container_id);
    }
}

/// TTL + capacity bounded mapping from syscall id to its canonical name, per
/// the data model's `SyscallIdToNameCache`.
#[derive(Clone)]
pub struct SyscallIdToNameCache {
    inner: Cache<u32, String>,
}

impl SyscallIdToNameCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get_or_resolve(&self, id: u32) -> Option<String> {
        if let Some(name) = self.inner.get(&id) {
            return Some(name);
        }
        let name = crate::identity::syscall_name_for_id(id)?;
        self.inner.insert(id, name.clone());
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_cache_round_trips() {
        let cache = PidToContainerCache::new(1000, Duration::from_secs(3600));
        assert_eq!(cache.get(42), None);
        cache.insert(42, "abc123".to_string());
        assert_eq!(cache.get(42), Some("abc123".to_string()));
    }

    #[test]
    fn syscall_name_cache_resolves_and_caches() {
        let cache = SyscallIdToNameCache::new(1000, Duration::from_secs(3600));
        let name = cache.get_or_resolve(0);
        assert!(name.is_some());
        // Second call should hit the cache and return the same value.
        assert_eq!(cache.get_or_resolve(0), name);
    }
}
