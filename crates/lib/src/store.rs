//! Tables and the in-memory row store backing them.
//!
//! The storage layer proper is a collaborator of the execution backend; this
//! module is the one concrete implementation the backend maps into its
//! arena: fixed-stride rows laid out by [`RowMajorFactory`], with a NULL
//! bitmap per row, plus optional ordered indexes over single columns.

use crate::index::{ArrayIndex, IndexHandle, ModelKey, RecursiveModelIndex};
use crate::layout::{DataLayout, ResultSetFactory, RowMajorFactory};
use crate::schema::{Schema, SchemaEntry};
use crate::types::Type;
use crate::value::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: Type,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Column {
            name: name.into(),
            ty,
        }
    }
}

/// A base table: a name and its columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Table {
            name: name.into(),
            columns,
        }
    }

    /// The table's schema with unqualified column identifiers.
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| SchemaEntry::new(c.name.clone(), c.ty))
                .collect(),
        )
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row arity {got} does not match table `{table}` with {expected} columns")]
    Arity {
        table: String,
        expected: usize,
        got: usize,
    },
    #[error("value {value:?} does not fit column `{column}` of type {ty}")]
    ValueMismatch {
        column: String,
        ty: Type,
        value: Value,
    },
    #[error("no column `{column}` in table `{table}`")]
    NoSuchColumn { table: String, column: String },
    #[error("column `{column}` of type {ty} cannot back a {kind} index")]
    UnsupportedIndexKey { column: String, ty: Type, kind: &'static str },
}

/// An append-only row store over one [`Table`].
pub struct RowStore {
    table: Arc<Table>,
    layout: DataLayout,
    data: Vec<u8>,
    num_rows: usize,
}

impl RowStore {
    pub fn new(table: Arc<Table>) -> Self {
        let layout = RowMajorFactory.make(&table.schema());
        RowStore {
            table,
            layout,
            data: Vec::new(),
            num_rows: 0,
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// The raw row image, `num_rows * stride` bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Appends one row; `None` slots become NULL.
    pub fn append(&mut self, row: &[Option<Value>]) -> Result<(), StoreError> {
        if row.len() != self.table.columns.len() {
            return Err(StoreError::Arity {
                table: self.table.name.clone(),
                expected: self.table.columns.len(),
                got: row.len(),
            });
        }
        for (col, value) in self.table.columns.iter().zip(row) {
            if let Some(v) = value {
                if !v.fits(&col.ty) {
                    return Err(StoreError::ValueMismatch {
                        column: col.name.clone(),
                        ty: col.ty,
                        value: v.clone(),
                    });
                }
            }
        }
        let base = self.data.len();
        self.data.resize(base + self.layout.stride, 0);
        let row_bytes = &mut self.data[base..];
        for (i, (col, value)) in self.table.columns.iter().zip(row).enumerate() {
            self.layout
                .write_value(row_bytes, i, &col.ty, value.as_ref());
        }
        self.num_rows += 1;
        Ok(())
    }

    /// Decodes row `row` back into values, one per column.
    pub fn read_row(&self, row: usize) -> Vec<Option<Value>> {
        let row_bytes = &self.data[self.layout.row_offset(row)..];
        self.table
            .columns
            .iter()
            .enumerate()
            .map(|(i, col)| self.layout.read_value(row_bytes, i, &col.ty))
            .collect()
    }

    /// Builds a sorted-array index over `column`; NULL rows are skipped.
    pub fn build_array_index(&self, column: &str) -> Result<IndexHandle, StoreError> {
        let col = self.column_position(column)?;
        let ty = self.table.columns[col].ty;
        let handle = match ty {
            Type::Bool => IndexHandle::ArrayBool(ArrayIndex::from_pairs(
                self.key_pairs(col, |v| v.as_bool()),
            )),
            Type::I8 => IndexHandle::ArrayI8(ArrayIndex::from_pairs(
                self.key_pairs(col, |v| v.as_i64().map(|i| i as i8)),
            )),
            Type::I16 => IndexHandle::ArrayI16(ArrayIndex::from_pairs(
                self.key_pairs(col, |v| v.as_i64().map(|i| i as i16)),
            )),
            Type::I32 | Type::Date => IndexHandle::ArrayI32(ArrayIndex::from_pairs(
                self.key_pairs(col, |v| v.as_i64().map(|i| i as i32)),
            )),
            Type::I64 | Type::Decimal { .. } | Type::DateTime => IndexHandle::ArrayI64(
                ArrayIndex::from_pairs(self.key_pairs(col, |v| v.as_i64())),
            ),
            Type::F32 => IndexHandle::ArrayF32(ArrayIndex::from_pairs(
                self.key_pairs(col, |v| v.as_f64().map(|f| f as f32)),
            )),
            Type::F64 => IndexHandle::ArrayF64(ArrayIndex::from_pairs(
                self.key_pairs(col, |v| v.as_f64()),
            )),
            Type::Char(_) => IndexHandle::ArrayStr(ArrayIndex::from_pairs(
                self.key_pairs(col, |v| v.as_str().map(|s| s.as_bytes().into())),
            )),
            Type::None => {
                return Err(StoreError::UnsupportedIndexKey {
                    column: column.into(),
                    ty,
                    kind: "array",
                })
            }
        };
        Ok(handle)
    }

    /// Builds a recursive-model index over `column`; NULL rows are skipped.
    /// Boolean and character columns cannot back a learned index.
    pub fn build_rmi_index(&self, column: &str) -> Result<IndexHandle, StoreError> {
        let col = self.column_position(column)?;
        let ty = self.table.columns[col].ty;
        fn rmi<K: ModelKey>(pairs: Vec<(K, u32)>) -> RecursiveModelIndex<K> {
            RecursiveModelIndex::from_pairs(pairs)
        }
        let handle = match ty {
            Type::I8 => IndexHandle::RmiI8(rmi(self.key_pairs(col, |v| v.as_i64().map(|i| i as i8)))),
            Type::I16 => {
                IndexHandle::RmiI16(rmi(self.key_pairs(col, |v| v.as_i64().map(|i| i as i16))))
            }
            Type::I32 | Type::Date => {
                IndexHandle::RmiI32(rmi(self.key_pairs(col, |v| v.as_i64().map(|i| i as i32))))
            }
            Type::I64 | Type::Decimal { .. } | Type::DateTime => {
                IndexHandle::RmiI64(rmi(self.key_pairs(col, |v| v.as_i64())))
            }
            Type::F32 => {
                IndexHandle::RmiF32(rmi(self.key_pairs(col, |v| v.as_f64().map(|f| f as f32))))
            }
            Type::F64 => IndexHandle::RmiF64(rmi(self.key_pairs(col, |v| v.as_f64()))),
            Type::Bool | Type::Char(_) | Type::None => {
                return Err(StoreError::UnsupportedIndexKey {
                    column: column.into(),
                    ty,
                    kind: "recursive-model",
                })
            }
        };
        Ok(handle)
    }

    fn column_position(&self, column: &str) -> Result<usize, StoreError> {
        self.table
            .column_position(column)
            .ok_or_else(|| StoreError::NoSuchColumn {
                table: self.table.name.clone(),
                column: column.into(),
            })
    }

    fn key_pairs<K>(&self, col: usize, extract: impl Fn(&Value) -> Option<K>) -> Vec<(K, u32)> {
        (0..self.num_rows)
            .filter_map(|row| {
                let row_bytes = &self.data[self.layout.row_offset(row)..];
                let v = self
                    .layout
                    .read_value(row_bytes, col, &self.table.columns[col].ty)?;
                extract(&v).map(|k| (k, row as u32))
            })
            .collect()
    }
}
