use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexMap;

use crate::sv::process::Process;

/// Insertion-ordered registry of processes by full name.
///
/// Iteration helpers return snapshots, never the underlying map, so
/// callers cannot hold a reference into the table across await points.
#[derive(Debug, Default)]
pub struct ProcTable {
    table: RwLock<IndexMap<String, Arc<Process>>>,
}

impl ProcTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Process>> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.get(name).cloned()
    }

    /// Insert a new process. Returns false (and leaves the table
    /// untouched) when the key already exists.
    pub fn add(&self, name: &str, proc: Arc<Process>) -> bool {
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        if table.contains_key(name) {
            return false;
        }
        table.insert(name.to_string(), proc);
        true
    }

    /// Remove an entry. The caller is responsible for having stopped the
    /// process first.
    pub fn del(&self, name: &str) -> bool {
        let mut table = self.table.write().unwrap_or_else(|p| p.into_inner());
        table.shift_remove(name).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Arc<Process>> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(String, Arc<Process>)> {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn len(&self) -> usize {
        let table = self.table.read().unwrap_or_else(|p| p.into_inner());
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct ProcListInner {
    next: i64,
    place: HashMap<String, i64>,
    table: HashMap<i64, String>,
}

/// Dense integer index over process full names. Indices are handed out in
/// strictly increasing order and never reused within a run; deletions do
/// not renumber survivors.
#[derive(Debug, Default)]
pub struct ProcList {
    inner: Mutex<ProcListInner>,
}

impl ProcList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, name: &str) -> Option<i64> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.place.get(name).copied()
    }

    pub fn get(&self, index: i64) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.table.get(&index).cloned()
    }

    pub fn add(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.place.contains_key(name) {
            return false;
        }
        let index = inner.next;
        inner.next += 1;
        inner.place.insert(name.to_string(), index);
        inner.table.insert(index, name.to_string());
        true
    }

    pub fn del(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let Some(index) = inner.place.remove(name) else {
            return false;
        };
        inner.table.remove(&index);
        true
    }

    pub fn all(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.place.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.place.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sv::options::ProcessOption;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn dummy_proc(full_name: &str) -> Arc<Process> {
        let opt = ProcessOption {
            root: PathBuf::from("/tmp"),
            pid_root: PathBuf::from("/tmp"),
            log_root: PathBuf::from("/tmp"),
            stop_signal: "TERM".to_string(),
            num_procs: 1,
            env: BTreeMap::new(),
            cmd: vec!["true".to_string()],
        };
        Arc::new(Process::new(full_name, opt, false))
    }

    #[test]
    fn proc_table_preserves_insertion_order() {
        let table = ProcTable::new();
        for name in ["a::one", "a::two", "b::three"] {
            assert!(table.add(name, dummy_proc(name)));
        }
        assert_eq!(table.keys(), vec!["a::one", "a::two", "b::three"]);

        // Duplicate insert is refused.
        assert!(!table.add("a::one", dummy_proc("a::one")));
        assert_eq!(table.len(), 3);

        assert!(table.del("a::two"));
        assert_eq!(table.keys(), vec!["a::one", "b::three"]);
        assert!(!table.del("a::two"));
    }

    #[test]
    fn proc_list_is_a_bijection() {
        let list = ProcList::new();
        assert!(list.add("a::one"));
        assert!(list.add("a::two"));
        assert!(!list.add("a::one"));

        for name in ["a::one", "a::two"] {
            let i = list.index(name).unwrap();
            assert_eq!(list.get(i).as_deref(), Some(name));
        }
        assert_eq!(list.index("missing"), None);
    }

    #[test]
    fn proc_list_never_reuses_indices() {
        let list = ProcList::new();
        list.add("a::one");
        list.add("a::two");
        let second = list.index("a::two").unwrap();

        assert!(list.del("a::one"));
        assert!(list.add("a::three"));
        let third = list.index("a::three").unwrap();

        // Survivors keep their index; the freed slot is not recycled.
        assert_eq!(list.index("a::two"), Some(second));
        assert!(third > second);
        assert_eq!(list.get(0), None);
    }
}
