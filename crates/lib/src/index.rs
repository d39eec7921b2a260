//! Ordered indexes served to queries by integer id.
//!
//! Two kinds exist: [`ArrayIndex`], a sorted array searched by binary
//! search, and [`RecursiveModelIndex`], a two-layer learned index whose
//! models predict a position that is then corrected by a bounded local
//! search. Both yield `(key, tuple-id)` pairs and support `lower_bound` /
//! `upper_bound` seeks plus random access by offset from the beginning.
//!
//! Host callbacks address indexes through the type-erased [`IndexHandle`],
//! tagged by `(kind, key type)`; lookups dispatch over that tag rather than
//! over open-ended runtime types.

use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Array,
    RecursiveModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Str,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KeyType::Bool => "bool",
            KeyType::I8 => "i8",
            KeyType::I16 => "i16",
            KeyType::I32 => "i32",
            KeyType::I64 => "i64",
            KeyType::F32 => "f32",
            KeyType::F64 => "f64",
            KeyType::Str => "string",
        };
        f.write_str(s)
    }
}

/// A key that was decoded from a host-callback argument.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(Box<[u8]>),
}

impl KeyValue {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyValue::Bool(_) => KeyType::Bool,
            KeyValue::I8(_) => KeyType::I8,
            KeyValue::I16(_) => KeyType::I16,
            KeyValue::I32(_) => KeyType::I32,
            KeyValue::I64(_) => KeyType::I64,
            KeyValue::F32(_) => KeyType::F32,
            KeyValue::F64(_) => KeyType::F64,
            KeyValue::Str(_) => KeyType::Str,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index expects {expected} keys but was probed with a {got} key")]
    KeyMismatch { expected: KeyType, got: KeyType },
    #[error("index scan out of bounds: entry {entry} + batch {batch} exceeds {len} entries")]
    ScanOutOfBounds { entry: u32, batch: u32, len: usize },
}

/// Total order on key types; floats order by `total_cmp` so that indexes can
/// hold them without a partial-order escape hatch.
pub trait IndexKey: Clone {
    fn key_cmp(&self, other: &Self) -> Ordering;
}

macro_rules! impl_key_ord {
    ($($t:ty),*) => {
        $(impl IndexKey for $t {
            fn key_cmp(&self, other: &Self) -> Ordering {
                self.cmp(other)
            }
        })*
    };
}
impl_key_ord!(bool, i8, i16, i32, i64, Box<[u8]>);

impl IndexKey for f32 {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl IndexKey for f64 {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

/// A sorted array of `(key, tuple-id)` pairs.
#[derive(Debug, Clone)]
pub struct ArrayIndex<K: IndexKey> {
    entries: Vec<(K, u32)>,
}

impl<K: IndexKey> ArrayIndex<K> {
    pub fn from_pairs(mut entries: Vec<(K, u32)>) -> Self {
        entries.sort_by(|a, b| a.0.key_cmp(&b.0));
        ArrayIndex { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, offset: usize) -> Option<&(K, u32)> {
        self.entries.get(offset)
    }

    /// Offset of the first entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &K) -> usize {
        self.entries
            .partition_point(|(k, _)| k.key_cmp(key) == Ordering::Less)
    }

    /// Offset of the first entry whose key is greater than `key`.
    pub fn upper_bound(&self, key: &K) -> usize {
        self.entries
            .partition_point(|(k, _)| k.key_cmp(key) != Ordering::Greater)
    }
}

/// Key types usable by the learned index: projectable onto the real line.
pub trait ModelKey: IndexKey {
    fn to_model(&self) -> f64;
}

macro_rules! impl_model_key {
    ($($t:ty),*) => {
        $(impl ModelKey for $t {
            fn to_model(&self) -> f64 {
                *self as f64
            }
        })*
    };
}
impl_model_key!(i8, i16, i32, i64, f32, f64);

#[derive(Debug, Clone, Copy)]
struct LinearModel {
    slope: f64,
    intercept: f64,
}

impl LinearModel {
    fn fit(points: impl Iterator<Item = (f64, f64)> + Clone) -> LinearModel {
        let n = points.clone().count();
        if n == 0 {
            return LinearModel {
                slope: 0.0,
                intercept: 0.0,
            };
        }
        let n_f = n as f64;
        let (mut sx, mut sy, mut sxx, mut sxy) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for (x, y) in points {
            sx += x;
            sy += y;
            sxx += x * x;
            sxy += x * y;
        }
        let denom = n_f * sxx - sx * sx;
        if denom.abs() < f64::EPSILON {
            // All keys equal; predict the mean position.
            return LinearModel {
                slope: 0.0,
                intercept: sy / n_f,
            };
        }
        let slope = (n_f * sxy - sx * sy) / denom;
        LinearModel {
            slope,
            intercept: (sy - slope * sx) / n_f,
        }
    }

    fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

#[derive(Debug, Clone, Copy)]
struct LeafModel {
    model: LinearModel,
    /// Signed prediction error bounds observed at build time.
    err_lo: i64,
    err_hi: i64,
}

/// Entries per second-layer model.
const RMI_LEAF_FANOUT: usize = 64;

/// A two-layer recursive model index: a root linear model routes a key to a
/// leaf model, whose prediction is corrected by a binary search within the
/// error bounds recorded at build time.
#[derive(Debug, Clone)]
pub struct RecursiveModelIndex<K: ModelKey> {
    entries: Vec<(K, u32)>,
    root: LinearModel,
    leaves: Vec<LeafModel>,
}

impl<K: ModelKey> RecursiveModelIndex<K> {
    pub fn from_pairs(mut entries: Vec<(K, u32)>) -> Self {
        entries.sort_by(|a, b| a.0.key_cmp(&b.0));
        let n = entries.len();
        let num_leaves = n.div_ceil(RMI_LEAF_FANOUT).max(1);
        log::trace!("training a recursive model index: {n} keys, {num_leaves} leaves");

        let root = LinearModel::fit(
            entries
                .iter()
                .enumerate()
                .map(move |(i, (k, _))| (k.to_model(), (i * num_leaves) as f64 / n.max(1) as f64)),
        );

        // Partition entries over leaves by the root's own routing, then fit
        // each leaf over its assigned entries and record the error bounds.
        let mut assignment: Vec<Vec<usize>> = vec![Vec::new(); num_leaves];
        for (i, (k, _)) in entries.iter().enumerate() {
            let leaf = route(&root, k.to_model(), num_leaves);
            assignment[leaf].push(i);
        }
        let leaves = assignment
            .into_iter()
            .map(|positions| {
                let model = LinearModel::fit(
                    positions
                        .iter()
                        .map(|&i| (entries[i].0.to_model(), i as f64))
                        .collect::<Vec<_>>()
                        .into_iter(),
                );
                let (mut err_lo, mut err_hi) = (0i64, 0i64);
                for &i in &positions {
                    let err = i as i64 - model.predict(entries[i].0.to_model()).round() as i64;
                    err_lo = err_lo.min(err);
                    err_hi = err_hi.max(err);
                }
                LeafModel {
                    model,
                    err_lo,
                    err_hi,
                }
            })
            .collect();

        RecursiveModelIndex {
            entries,
            root,
            leaves,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, offset: usize) -> Option<&(K, u32)> {
        self.entries.get(offset)
    }

    fn search_window(&self, key: &K) -> (usize, usize) {
        let n = self.entries.len();
        if n == 0 {
            return (0, 0);
        }
        let leaf = &self.leaves[route(&self.root, key.to_model(), self.leaves.len())];
        let predicted = leaf.model.predict(key.to_model()).round() as i64;
        let lo = (predicted + leaf.err_lo - 1).clamp(0, n as i64) as usize;
        let hi = (predicted + leaf.err_hi + 2).clamp(lo as i64, n as i64) as usize;
        (lo, hi)
    }

    fn bounded_partition_point(&self, key: &K, pred: impl Fn(&K, &K) -> bool) -> usize {
        let n = self.entries.len();
        let (lo, hi) = self.search_window(key);
        let window = &self.entries[lo..hi];
        let p = lo + window.partition_point(|(k, _)| pred(k, key));
        // The window is a heuristic; verify the boundary globally and fall
        // back to a full search if the models misrouted this key.
        let valid = (p == 0 || pred(&self.entries[p - 1].0, key))
            && (p == n || !pred(&self.entries[p].0, key));
        if valid {
            p
        } else {
            self.entries.partition_point(|(k, _)| pred(k, key))
        }
    }

    /// Offset of the first entry whose key is not less than `key`.
    pub fn lower_bound(&self, key: &K) -> usize {
        self.bounded_partition_point(key, |k, key| k.key_cmp(key) == Ordering::Less)
    }

    /// Offset of the first entry whose key is greater than `key`.
    pub fn upper_bound(&self, key: &K) -> usize {
        self.bounded_partition_point(key, |k, key| k.key_cmp(key) != Ordering::Greater)
    }
}

fn route(root: &LinearModel, x: f64, num_leaves: usize) -> usize {
    let leaf = root.predict(x);
    if leaf.is_nan() {
        return 0;
    }
    (leaf as i64).clamp(0, num_leaves as i64 - 1) as usize
}

/// A type-erased index, tagged by `(kind, key type)`.
#[derive(Debug, Clone)]
pub enum IndexHandle {
    ArrayBool(ArrayIndex<bool>),
    ArrayI8(ArrayIndex<i8>),
    ArrayI16(ArrayIndex<i16>),
    ArrayI32(ArrayIndex<i32>),
    ArrayI64(ArrayIndex<i64>),
    ArrayF32(ArrayIndex<f32>),
    ArrayF64(ArrayIndex<f64>),
    ArrayStr(ArrayIndex<Box<[u8]>>),
    RmiI8(RecursiveModelIndex<i8>),
    RmiI16(RecursiveModelIndex<i16>),
    RmiI32(RecursiveModelIndex<i32>),
    RmiI64(RecursiveModelIndex<i64>),
    RmiF32(RecursiveModelIndex<f32>),
    RmiF64(RecursiveModelIndex<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeekBound {
    Lower,
    Upper,
}

macro_rules! with_index {
    ($handle:expr, $ix:ident => $body:expr) => {
        match $handle {
            IndexHandle::ArrayBool($ix) => $body,
            IndexHandle::ArrayI8($ix) => $body,
            IndexHandle::ArrayI16($ix) => $body,
            IndexHandle::ArrayI32($ix) => $body,
            IndexHandle::ArrayI64($ix) => $body,
            IndexHandle::ArrayF32($ix) => $body,
            IndexHandle::ArrayF64($ix) => $body,
            IndexHandle::ArrayStr($ix) => $body,
            IndexHandle::RmiI8($ix) => $body,
            IndexHandle::RmiI16($ix) => $body,
            IndexHandle::RmiI32($ix) => $body,
            IndexHandle::RmiI64($ix) => $body,
            IndexHandle::RmiF32($ix) => $body,
            IndexHandle::RmiF64($ix) => $body,
        }
    };
}

impl IndexHandle {
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexHandle::ArrayBool(_)
            | IndexHandle::ArrayI8(_)
            | IndexHandle::ArrayI16(_)
            | IndexHandle::ArrayI32(_)
            | IndexHandle::ArrayI64(_)
            | IndexHandle::ArrayF32(_)
            | IndexHandle::ArrayF64(_)
            | IndexHandle::ArrayStr(_) => IndexKind::Array,
            _ => IndexKind::RecursiveModel,
        }
    }

    pub fn key_type(&self) -> KeyType {
        match self {
            IndexHandle::ArrayBool(_) => KeyType::Bool,
            IndexHandle::ArrayI8(_) | IndexHandle::RmiI8(_) => KeyType::I8,
            IndexHandle::ArrayI16(_) | IndexHandle::RmiI16(_) => KeyType::I16,
            IndexHandle::ArrayI32(_) | IndexHandle::RmiI32(_) => KeyType::I32,
            IndexHandle::ArrayI64(_) | IndexHandle::RmiI64(_) => KeyType::I64,
            IndexHandle::ArrayF32(_) | IndexHandle::RmiF32(_) => KeyType::F32,
            IndexHandle::ArrayF64(_) | IndexHandle::RmiF64(_) => KeyType::F64,
            IndexHandle::ArrayStr(_) => KeyType::Str,
        }
    }

    pub fn len(&self) -> usize {
        with_index!(self, ix => ix.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mismatch(&self, key: &KeyValue) -> IndexError {
        IndexError::KeyMismatch {
            expected: self.key_type(),
            got: key.key_type(),
        }
    }

    /// Distance from the beginning of the index to the seeked entry.
    pub fn seek(&self, key: &KeyValue, bound: SeekBound) -> Result<u32, IndexError> {
        macro_rules! seek {
            ($ix:expr, $k:expr) => {
                match bound {
                    SeekBound::Lower => $ix.lower_bound($k),
                    SeekBound::Upper => $ix.upper_bound($k),
                }
            };
        }
        let offset = match (self, key) {
            (IndexHandle::ArrayBool(ix), KeyValue::Bool(k)) => seek!(ix, k),
            (IndexHandle::ArrayI8(ix), KeyValue::I8(k)) => seek!(ix, k),
            (IndexHandle::ArrayI16(ix), KeyValue::I16(k)) => seek!(ix, k),
            (IndexHandle::ArrayI32(ix), KeyValue::I32(k)) => seek!(ix, k),
            (IndexHandle::ArrayI64(ix), KeyValue::I64(k)) => seek!(ix, k),
            (IndexHandle::ArrayF32(ix), KeyValue::F32(k)) => seek!(ix, k),
            (IndexHandle::ArrayF64(ix), KeyValue::F64(k)) => seek!(ix, k),
            (IndexHandle::ArrayStr(ix), KeyValue::Str(k)) => seek!(ix, k),
            (IndexHandle::RmiI8(ix), KeyValue::I8(k)) => seek!(ix, k),
            (IndexHandle::RmiI16(ix), KeyValue::I16(k)) => seek!(ix, k),
            (IndexHandle::RmiI32(ix), KeyValue::I32(k)) => seek!(ix, k),
            (IndexHandle::RmiI64(ix), KeyValue::I64(k)) => seek!(ix, k),
            (IndexHandle::RmiF32(ix), KeyValue::F32(k)) => seek!(ix, k),
            (IndexHandle::RmiF64(ix), KeyValue::F64(k)) => seek!(ix, k),
            _ => return Err(self.mismatch(key)),
        };
        Ok(offset as u32)
    }

    /// Tuple ids of `batch` consecutive entries starting at `entry`.
    pub fn scan(&self, entry: u32, batch: u32) -> Result<Vec<u32>, IndexError> {
        let len = self.len();
        let end = entry as usize + batch as usize;
        if end > len {
            return Err(IndexError::ScanOutOfBounds { entry, batch, len });
        }
        let ids = with_index!(self, ix => {
            (entry as usize..end)
                .map(|off| ix.entry(off).map(|(_, id)| *id).unwrap_or_default())
                .collect()
        });
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_bounds_on_duplicates() {
        let ix = ArrayIndex::from_pairs(vec![(1i32, 0), (3, 1), (3, 2), (5, 3)]);
        assert_eq!(ix.lower_bound(&3), 1);
        assert_eq!(ix.upper_bound(&3), 3);
        assert_eq!(ix.lower_bound(&0), 0);
        assert_eq!(ix.upper_bound(&9), 4);
    }

    #[test]
    fn handle_seek_and_scan() {
        let handle = IndexHandle::ArrayI32(ArrayIndex::from_pairs(vec![
            (1, 10),
            (3, 11),
            (3, 12),
            (5, 13),
        ]));
        let lo = handle.seek(&KeyValue::I32(3), SeekBound::Lower).unwrap();
        let hi = handle.seek(&KeyValue::I32(3), SeekBound::Upper).unwrap();
        assert_eq!((lo, hi), (1, 3));
        assert_eq!(handle.scan(lo, hi - lo).unwrap(), vec![11, 12]);
    }

    #[test]
    fn handle_rejects_mismatched_key() {
        let handle = IndexHandle::ArrayI32(ArrayIndex::from_pairs(vec![(1, 0)]));
        let err = handle.seek(&KeyValue::F64(1.0), SeekBound::Lower);
        assert!(matches!(err, Err(IndexError::KeyMismatch { .. })));
    }

    #[test]
    fn scan_past_the_end_is_rejected() {
        let handle = IndexHandle::ArrayI32(ArrayIndex::from_pairs(vec![(1, 0), (2, 1)]));
        assert!(handle.scan(1, 2).is_err());
    }

    #[test]
    fn string_keys_compare_bytewise() {
        let key = |s: &str| -> Box<[u8]> { s.as_bytes().into() };
        let ix = ArrayIndex::from_pairs(vec![(key("b"), 1), (key("a"), 0), (key("c"), 2)]);
        assert_eq!(ix.lower_bound(&key("b")), 1);
        assert_eq!(ix.upper_bound(&key("b")), 2);
    }

    #[test]
    fn rmi_agrees_with_binary_search() {
        let pairs: Vec<(i64, u32)> = (0..1000)
            .map(|i| ((i * i % 7919) as i64, i as u32))
            .collect();
        let rmi = RecursiveModelIndex::from_pairs(pairs.clone());
        let array = ArrayIndex::from_pairs(pairs);
        for probe in [-1i64, 0, 1, 500, 3960, 7918, 7919, 10000] {
            assert_eq!(rmi.lower_bound(&probe), array.lower_bound(&probe), "lower {probe}");
            assert_eq!(rmi.upper_bound(&probe), array.upper_bound(&probe), "upper {probe}");
        }
    }

    #[test]
    fn rmi_handles_skewed_keys() {
        let mut pairs: Vec<(i64, u32)> = (0..256).map(|i| (i, i as u32)).collect();
        pairs.extend((0..256).map(|i| (1_000_000 + i, 256 + i as u32)));
        let rmi = RecursiveModelIndex::from_pairs(pairs);
        assert_eq!(rmi.lower_bound(&255), 255);
        assert_eq!(rmi.lower_bound(&256), 256);
        assert_eq!(rmi.lower_bound(&1_000_000), 256);
        assert_eq!(rmi.upper_bound(&1_000_255), 512);
    }
}
