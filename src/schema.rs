use std::collections::HashMap;

use crate::error::{GraphError, Result};
use crate::types::LabelId;

/// One direction-pair of the `string <-> u16` mappings shipped next to the
/// graph text files.
#[derive(Debug, Default, Clone)]
pub struct NameTable {
    to_id: HashMap<String, LabelId>,
    to_name: HashMap<LabelId, String>,
}

impl NameTable {
    pub fn insert(&mut self, name: impl Into<String>, id: LabelId) {
        let name = name.into();
        self.to_id.insert(name.clone(), id);
        self.to_name.insert(id, name);
    }

    pub fn id(&self, name: &str) -> Option<LabelId> {
        self.to_id.get(name).copied()
    }

    pub fn name(&self, id: LabelId) -> Option<&str> {
        self.to_name.get(&id).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.to_id.keys().map(String::as_str)
    }

    /// Parses `name \t id` lines.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = NameTable::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(name), Some(id)) = (parts.next(), parts.next()) else {
                return Err(GraphError::Parse(format!("bad index line: {line}")));
            };
            let id: LabelId = id
                .parse()
                .map_err(|_| GraphError::Parse(format!("bad index id: {line}")))?;
            table.insert(name, id);
        }
        Ok(table)
    }
}

/// The four name indexes: vertex labels, edge labels, vertex property keys,
/// edge property keys. Shared read-only across all workers.
#[derive(Debug, Default, Clone)]
pub struct SchemaIndex {
    pub vertex_labels: NameTable,
    pub edge_labels: NameTable,
    pub vertex_prop_keys: NameTable,
    pub edge_prop_keys: NameTable,
}

impl SchemaIndex {
    pub fn expected_keys(&self, vertex: bool, labels: bool) -> String {
        let table = match (vertex, labels) {
            (true, true) => &self.vertex_labels,
            (true, false) => &self.vertex_prop_keys,
            (false, true) => &self.edge_labels,
            (false, false) => &self.edge_prop_keys,
        };
        let mut names: Vec<&str> = table.names().collect();
        names.sort_unstable();
        names.join(" ")
    }
}
