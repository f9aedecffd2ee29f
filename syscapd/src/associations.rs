use dashmap::DashMap;
use std::hash::Hash;

/// A bidirectional map kept consistent by its own insert/delete paths.
/// Inserting an edge `(k, v)` overwrites any existing edge on either side,
/// so both the forward and reverse tables remain partial functions.
pub struct BiMap<K, V> {
    forward: DashMap<K, V>,
    reverse: DashMap<V, K>,
}

impl<K, V> BiMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
        }
    }

    /// Insert `k <-> v`, removing any prior edge that conflicts with either
    /// endpoint.
    pub fn insert(&self, k: K, v: V) {
        if let Some((_, old_v)) = self.forward.remove(&k) {
            self.reverse.remove(&old_v);
        }
        if let Some((_, old_k)) = self.reverse.remove(&v) {
            self.forward.remove(&old_k);
        }
        self.forward.insert(k.clone(), v.clone());
        self.reverse.insert(v, k);
    }

    pub fn get(&self, k: &K) -> Option<V> {
        self.forward.get(k).map(|e| e.value().clone())
    }

    pub fn get_reverse(&self, v: &V) -> Option<K> {
        self.reverse.get(v).map(|e| e.value().clone())
    }

    /// Remove the edge keyed by `k` on the forward side, if any, dropping
    /// its reverse entry too.
    pub fn delete(&self, k: &K) {
        if let Some((_, v)) = self.forward.remove(k) {
            self.reverse.remove(&v);
        }
    }

    /// Remove the edge keyed by `v` on the reverse side, if any, dropping
    /// its forward entry too.
    pub fn delete_reverse(&self, v: &V) {
        if let Some((_, k)) = self.reverse.remove(v) {
            self.forward.remove(&k);
        }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

impl<K, V> Default for BiMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// `M1`: mount namespace id <-> container id.
pub type MntnsContainerMap = BiMap<u32, String>;

/// `M2`: container id <-> profile label.
pub type ContainerProfileMap = BiMap<String, String>;

/// The process-wide association store: `M1` and `M2` from the data model.
#[derive(Default)]
pub struct Associations {
    pub mntns_container: MntnsContainerMap,
    pub container_profile: ContainerProfileMap,
}

impl Associations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a profile label all the way down to its mount namespace via
    /// `M2⁻¹ ∘ M1⁻¹`.
    pub fn mntns_for_profile(&self, profile: &str) -> Option<u32> {
        let container_id = self.container_profile.get_reverse(&profile.to_string())?;
        self.mntns_container.get_reverse(&container_id)
    }

    /// Remove the `M2` edge for `profile` and the `M1` edge for the
    /// container id it pointed at, per the drain path's cleanup step.
    pub fn remove_profile(&self, profile: &str) {
        if let Some(container_id) = self.container_profile.get_reverse(&profile.to_string()) {
            self.container_profile.delete_reverse(&profile.to_string());
            self.mntns_container.delete_reverse(&container_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_overwrites_conflicting_forward_edge() {
        let map: BiMap<u32, String> = BiMap::new();
        map.insert(1, "a".to_string());
        map.insert(1, "b".to_string());
        assert_eq!(map.get(&1), Some("b".to_string()));
        assert_eq!(map.get_reverse(&"a".to_string()), None);
        assert_eq!(map.get_reverse(&"b".to_string()), Some(1));
    }

    #[test]
    fn insert_overwrites_conflicting_reverse_edge() {
        let map: BiMap<u32, String> = BiMap::new();
        map.insert(1, "a".to_string());
        map.insert(2, "a".to_string());
        assert_eq!(map.get(&1), None);
        assert_eq!(map.get(&2), Some("a".to_string()));
    }

    #[test]
    fn delete_removes_both_sides() {
        let map: BiMap<u32, String> = BiMap::new();
        map.insert(1, "a".to_string());
        map.delete(&1);
        assert_eq!(map.get(&1), None);
        assert_eq!(map.get_reverse(&"a".to_string()), None);
    }

    #[test]
    fn resolve_profile_chain_and_cleanup() {
        let assoc = Associations::new();
        assoc.mntns_container.insert(4026532001, "abc123".to_string());
        assoc
            .container_profile
            .insert("abc123".to_string(), "myprofile".to_string());

        assert_eq!(assoc.mntns_for_profile("myprofile"), Some(4026532001));

        assoc.remove_profile("myprofile");
        assert_eq!(assoc.mntns_for_profile("myprofile"), None);
        // M1 edge for the container id is removed by remove_profile too.
        assert_eq!(
            assoc.mntns_container.get_reverse(&"abc123".to_string()),
            None
        );
    }

    #[test]
    fn remove_profile_without_edge_is_a_no_op() {
        let assoc = Associations::new();
        assoc.remove_profile("ghost");
        assert_eq!(assoc.mntns_for_profile("ghost"), None);
    }
}
