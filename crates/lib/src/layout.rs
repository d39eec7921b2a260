//! Data layouts for materialized rows.
//!
//! A [`DataLayout`] fixes, for one schema, where each column and the NULL
//! bitmap live within a row and how far apart consecutive rows are. The same
//! layout serves the row store and the query result buffer, so the code the
//! backend generates and the reader that decodes its output agree by
//! construction.

use crate::schema::Schema;
use crate::types::Type;
use crate::value::Value;

/// Byte offset of one column within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSlot {
    pub offset: usize,
}

/// Row-major layout: a NULL bitmap (one bit per column, LSB first) followed
/// by the column values at naturally aligned offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct DataLayout {
    pub stride: usize,
    pub null_bitmap_offset: usize,
    pub null_bitmap_bytes: usize,
    pub slots: Vec<ColumnSlot>,
}

impl DataLayout {
    pub fn row_offset(&self, row: usize) -> usize {
        row * self.stride
    }

    /// Byte offset of column `col` in row `row`.
    pub fn slot_offset(&self, row: usize, col: usize) -> usize {
        self.row_offset(row) + self.slots[col].offset
    }

    /// Whether the NULL bit for `col` is set in the row starting at `row`.
    pub fn is_null(&self, row_bytes: &[u8], col: usize) -> bool {
        let byte = row_bytes[self.null_bitmap_offset + col / 8];
        byte & (1 << (col % 8)) != 0
    }

    pub fn set_null(&self, row_bytes: &mut [u8], col: usize, null: bool) {
        let byte = &mut row_bytes[self.null_bitmap_offset + col / 8];
        if null {
            *byte |= 1 << (col % 8);
        } else {
            *byte &= !(1 << (col % 8));
        }
    }

    /// Decodes column `col` of the row starting at `row_bytes`. Returns
    /// `None` when the NULL bit is set.
    pub fn read_value(&self, row_bytes: &[u8], col: usize, ty: &Type) -> Option<Value> {
        if self.is_null(row_bytes, col) {
            return None;
        }
        let off = self.slots[col].offset;
        let v = match ty {
            Type::Bool => Value::Bool(row_bytes[off] != 0),
            Type::I8 => Value::Int(i64::from(row_bytes[off] as i8)),
            Type::I16 => Value::Int(i64::from(i16::from_le_bytes(
                row_bytes[off..off + 2].try_into().unwrap(),
            ))),
            Type::I32 => Value::Int(i64::from(i32::from_le_bytes(
                row_bytes[off..off + 4].try_into().unwrap(),
            ))),
            Type::I64 | Type::Decimal { .. } => Value::Int(i64::from_le_bytes(
                row_bytes[off..off + 8].try_into().unwrap(),
            )),
            Type::F32 => Value::Float(f64::from(f32::from_le_bytes(
                row_bytes[off..off + 4].try_into().unwrap(),
            ))),
            Type::F64 => Value::Float(f64::from_le_bytes(
                row_bytes[off..off + 8].try_into().unwrap(),
            )),
            Type::Char(n) => {
                let bytes = &row_bytes[off..off + n + 1];
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Value::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            Type::Date => Value::Date(i32::from_le_bytes(
                row_bytes[off..off + 4].try_into().unwrap(),
            )),
            Type::DateTime => Value::DateTime(i64::from_le_bytes(
                row_bytes[off..off + 8].try_into().unwrap(),
            )),
            Type::None => return None,
        };
        Some(v)
    }

    /// Encodes `value` into column `col` of the row starting at `row_bytes`,
    /// clearing or setting the NULL bit as appropriate.
    pub fn write_value(&self, row_bytes: &mut [u8], col: usize, ty: &Type, value: Option<&Value>) {
        let Some(value) = value else {
            self.set_null(row_bytes, col, true);
            return;
        };
        self.set_null(row_bytes, col, false);
        let off = self.slots[col].offset;
        match (ty, value) {
            (Type::Bool, Value::Bool(b)) => row_bytes[off] = *b as u8,
            (Type::I8, Value::Int(i)) => row_bytes[off] = *i as i8 as u8,
            (Type::I16, Value::Int(i)) => {
                row_bytes[off..off + 2].copy_from_slice(&(*i as i16).to_le_bytes())
            }
            (Type::I32, Value::Int(i)) => {
                row_bytes[off..off + 4].copy_from_slice(&(*i as i32).to_le_bytes())
            }
            (Type::I64 | Type::Decimal { .. }, Value::Int(i)) => {
                row_bytes[off..off + 8].copy_from_slice(&i.to_le_bytes())
            }
            (Type::F32, Value::Float(f)) => {
                row_bytes[off..off + 4].copy_from_slice(&(*f as f32).to_le_bytes())
            }
            (Type::F64, Value::Float(f)) => {
                row_bytes[off..off + 8].copy_from_slice(&f.to_le_bytes())
            }
            (Type::Char(n), Value::Str(s)) => {
                let bytes = s.as_bytes();
                let len = bytes.len().min(*n);
                row_bytes[off..off + len].copy_from_slice(&bytes[..len]);
                for b in &mut row_bytes[off + len..off + n + 1] {
                    *b = 0;
                }
            }
            (Type::Date, Value::Date(d)) => {
                row_bytes[off..off + 4].copy_from_slice(&d.to_le_bytes())
            }
            (Type::DateTime, Value::DateTime(t)) => {
                row_bytes[off..off + 8].copy_from_slice(&t.to_le_bytes())
            }
            (ty, value) => {
                unreachable!("value {value:?} written to column of type {ty}")
            }
        }
    }
}

/// Produces a concrete [`DataLayout`] for a schema.
pub trait ResultSetFactory: Send + Sync {
    fn make(&self, schema: &Schema) -> DataLayout;
}

/// The default factory: NULL bitmap first, then naturally aligned columns in
/// schema order, stride rounded up to the widest alignment.
#[derive(Debug, Default, Clone, Copy)]
pub struct RowMajorFactory;

impl ResultSetFactory for RowMajorFactory {
    fn make(&self, schema: &Schema) -> DataLayout {
        let n = schema.num_entries();
        let bitmap_bytes = n.div_ceil(8);
        let mut offset = bitmap_bytes;
        let mut max_align = 1;
        let mut slots = Vec::with_capacity(n);
        for entry in schema.iter() {
            let align = entry.ty.align();
            max_align = max_align.max(align);
            offset = offset.next_multiple_of(align);
            slots.push(ColumnSlot { offset });
            offset += entry.ty.size();
        }
        DataLayout {
            stride: offset.next_multiple_of(max_align),
            null_bitmap_offset: 0,
            null_bitmap_bytes: bitmap_bytes,
            slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaEntry;

    #[test]
    fn columns_are_aligned() {
        let schema = Schema::new(vec![
            SchemaEntry::new("a", Type::I8),
            SchemaEntry::new("b", Type::I64),
            SchemaEntry::new("c", Type::I16),
        ]);
        let layout = RowMajorFactory.make(&schema);
        assert_eq!(layout.null_bitmap_bytes, 1);
        assert_eq!(layout.slots[0].offset, 1);
        assert_eq!(layout.slots[1].offset, 8);
        assert_eq!(layout.slots[2].offset, 16);
        assert_eq!(layout.stride, 24);
    }

    #[test]
    fn value_round_trip() {
        let schema = Schema::new(vec![
            SchemaEntry::new("i", Type::I32),
            SchemaEntry::new("s", Type::Char(5)),
            SchemaEntry::new("d", Type::Date),
        ]);
        let layout = RowMajorFactory.make(&schema);
        let mut row = vec![0u8; layout.stride];
        layout.write_value(&mut row, 0, &Type::I32, Some(&Value::Int(-7)));
        layout.write_value(&mut row, 1, &Type::Char(5), Some(&Value::Str("ab".into())));
        layout.write_value(&mut row, 2, &Type::Date, None);
        assert_eq!(
            layout.read_value(&row, 0, &Type::I32),
            Some(Value::Int(-7))
        );
        assert_eq!(
            layout.read_value(&row, 1, &Type::Char(5)),
            Some(Value::Str("ab".into()))
        );
        assert_eq!(layout.read_value(&row, 2, &Type::Date), None);
    }
}
