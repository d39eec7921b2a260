//! Tuples: ordered values sized by a schema.

use crate::schema::Schema;
use crate::value::Value;

/// A row of values. Slots that were never set are NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    values: Vec<Option<Value>>,
}

impl Tuple {
    /// A tuple with one (initially NULL) slot per schema entry.
    pub fn new(schema: &Schema) -> Self {
        Tuple {
            values: vec![None; schema.num_entries()],
        }
    }

    pub fn with_len(len: usize) -> Self {
        Tuple {
            values: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn set(&mut self, idx: usize, value: Value) {
        self.values[idx] = Some(value);
    }

    pub fn unset(&mut self, idx: usize) {
        self.values[idx] = None;
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx).and_then(|v| v.as_ref())
    }

    pub fn is_null(&self, idx: usize) -> bool {
        self.values.get(idx).map_or(true, |v| v.is_none())
    }

    /// Resets every slot to NULL, keeping the arity.
    pub fn clear(&mut self) {
        for v in &mut self.values {
            *v = None;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&Value>> {
        self.values.iter().map(|v| v.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaEntry;
    use crate::types::Type;

    #[test]
    fn unset_slots_are_null() {
        let schema = Schema::new(vec![
            SchemaEntry::new("a", Type::I32),
            SchemaEntry::new("b", Type::Char(4)),
        ]);
        let mut tup = Tuple::new(&schema);
        assert!(tup.is_null(0));
        tup.set(0, Value::Int(7));
        assert_eq!(tup.get(0), Some(&Value::Int(7)));
        assert!(tup.is_null(1));
        tup.clear();
        assert!(tup.is_null(0));
    }
}
