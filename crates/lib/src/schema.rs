//! Schemas and their deduplicated views.

use crate::types::Type;
use std::fmt;
use std::ops::Index;

/// One entry of a [`Schema`]: an identifier, a type, and a marker telling
/// whether the entry is constant-valued for the whole result set.
///
/// Constant entries do not occupy space in a materialized result buffer;
/// their value comes from the projection that introduced them.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    pub id: String,
    pub ty: Type,
    pub constant: bool,
}

impl SchemaEntry {
    pub fn new(id: impl Into<String>, ty: Type) -> Self {
        SchemaEntry {
            id: id.into(),
            ty,
            constant: false,
        }
    }

    pub fn constant(id: impl Into<String>, ty: Type) -> Self {
        SchemaEntry {
            id: id.into(),
            ty,
            constant: true,
        }
    }
}

/// An ordered sequence of [`SchemaEntry`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    entries: Vec<SchemaEntry>,
}

impl Schema {
    pub fn new(entries: Vec<SchemaEntry>) -> Self {
        Schema { entries }
    }

    pub fn push(&mut self, entry: SchemaEntry) {
        self.entries.push(entry);
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&SchemaEntry> {
        self.entries.get(idx)
    }

    /// Position and entry of the first occurrence of `id`.
    pub fn find(&self, id: &str) -> Option<(usize, &SchemaEntry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.id == id)
            .map(|(i, e)| (i, e))
    }

    /// This schema with duplicate identifiers collapsed; the first occurrence
    /// of each identifier wins.
    pub fn deduplicate(&self) -> Schema {
        let mut out = Schema::default();
        for e in &self.entries {
            if out.find(&e.id).is_none() {
                out.push(e.clone());
            }
        }
        out
    }

    /// This schema with constant entries removed.
    pub fn drop_constants(&self) -> Schema {
        Schema {
            entries: self
                .entries
                .iter()
                .filter(|e| !e.constant)
                .cloned()
                .collect(),
        }
    }
}

impl Index<usize> for Schema {
    type Output = SchemaEntry;

    fn index(&self, idx: usize) -> &SchemaEntry {
        &self.entries[idx]
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", e.id, e.ty)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            SchemaEntry::new("t.id", Type::I32),
            SchemaEntry::constant("$const0", Type::I32),
            SchemaEntry::new("t.id", Type::I32),
            SchemaEntry::new("t.name", Type::Char(8)),
        ])
    }

    #[test]
    fn deduplicate_keeps_first_occurrence() {
        let d = schema().deduplicate();
        assert_eq!(d.num_entries(), 3);
        assert_eq!(d[0].id, "t.id");
        assert_eq!(d[1].id, "$const0");
        assert_eq!(d[2].id, "t.name");
    }

    #[test]
    fn drop_constants_removes_marked_entries() {
        let p = schema().deduplicate().drop_constants();
        assert_eq!(p.num_entries(), 2);
        assert!(p.iter().all(|e| !e.constant));
    }

    #[test]
    fn find_returns_first_position() {
        let s = schema();
        let (idx, e) = s.find("t.id").unwrap();
        assert_eq!(idx, 0);
        assert_eq!(e.ty, Type::I32);
    }
}
