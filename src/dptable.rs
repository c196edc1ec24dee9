//! Datapath port table collaborator
//!
//! Maps UDP destination ports to tunnel kinds for kernel offload of "native"
//! tunnel vports. Owned by the enclosing switch runtime; out of scope here.
//! This module only defines the trait surface `PortRegistry` calls into, plus
//! an in-memory implementation for tests and the demonstration binary.

use std::collections::HashMap;

use parking_lot::Mutex;

pub trait DatapathPortTable: std::fmt::Debug + Send + Sync {
    fn insert(&self, odp_port: u32, dst_port: u16, name: &str);
    fn remove(&self, dst_port: u16);
}

#[derive(Debug, Default)]
pub struct InMemoryDatapathPortTable {
    entries: Mutex<HashMap<u16, (u32, String)>>,
}

impl InMemoryDatapathPortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, dst_port: u16) -> Option<(u32, String)> {
        self.entries.lock().get(&dst_port).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DatapathPortTable for InMemoryDatapathPortTable {
    fn insert(&self, odp_port: u32, dst_port: u16, name: &str) {
        self.entries.lock().insert(dst_port, (odp_port, name.to_string()));
    }

    fn remove(&self, dst_port: u16) {
        self.entries.lock().remove(&dst_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_remove() {
        let table = InMemoryDatapathPortTable::new();
        table.insert(7, 4789, "vxlan0");
        assert_eq!(table.get(4789), Some((7, "vxlan0".to_string())));
        table.remove(4789);
        assert_eq!(table.get(4789), None);
    }
}
