//! Per-query Wasm contexts and the process-wide registry.
//!
//! Host callbacks invoked by the guest receive nothing but the module id;
//! the registry is their sole way back to the per-query state: the arena,
//! the mapped tables, the registered indexes, the message table and the
//! matched plan.

use crate::arena::{Arena, ArenaError};
use crate::config::ContextConfig;
use crate::error::BackendError;
use nohash_hasher::IntMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use quern_lib::index::IndexHandle;
use quern_lib::layout::ResultSetFactory;
use quern_lib::plan::PhysicalPlan;
use quern_lib::store::RowStore;
use std::collections::HashMap;
use std::sync::Arc;

pub type ContextId = u32;

/// One entry of the module's message table: the provenance attached to
/// `insist` and `throw` call sites in generated code.
#[derive(Debug, Clone)]
pub struct Message {
    pub file: String,
    pub line: u32,
    pub msg: String,
}

/// An index registered for one query, addressable by integer id from host
/// callbacks.
pub struct QueryIndex {
    pub table: String,
    pub column: String,
    pub handle: IndexHandle,
}

/// Host-side state of one query, immutable once registered.
pub struct WasmContext {
    pub id: ContextId,
    arena: Arena,
    config: ContextConfig,
    plan: Arc<PhysicalPlan>,
    result_set_factory: Arc<dyn ResultSetFactory>,
    table_offsets: HashMap<String, u32>,
    indexes: Vec<QueryIndex>,
    messages: Vec<Message>,
}

impl WasmContext {
    pub fn new(
        id: ContextId,
        plan: Arc<PhysicalPlan>,
        config: ContextConfig,
        vm_size: usize,
        result_set_factory: Arc<dyn ResultSetFactory>,
    ) -> Result<Self, BackendError> {
        let arena = Arena::reserve(vm_size, config.contains(ContextConfig::TRAP_GUARD_PAGES))?;
        Ok(WasmContext {
            id,
            arena,
            config,
            plan,
            result_set_factory,
            table_offsets: HashMap::new(),
            indexes: Vec::new(),
            messages: Vec::new(),
        })
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn config(&self) -> ContextConfig {
        self.config
    }

    pub fn plan(&self) -> &Arc<PhysicalPlan> {
        &self.plan
    }

    pub fn result_set_factory(&self) -> &dyn ResultSetFactory {
        &*self.result_set_factory
    }

    /// Maps a base table's row image into the arena once; repeated calls for
    /// the same table return the original offset.
    pub fn map_table(&mut self, store: &RowStore) -> Result<u32, ArenaError> {
        let name = &store.table().name;
        if let Some(&offset) = self.table_offsets.get(name) {
            return Ok(offset);
        }
        let offset = self.arena.append(store.bytes())?;
        self.table_offsets.insert(name.clone(), offset);
        Ok(offset)
    }

    pub fn table_offset(&self, name: &str) -> Option<u32> {
        self.table_offsets.get(name).copied()
    }

    /// Maps the deduplicated string literals into one contiguous region,
    /// NUL-terminated back to back, returning each literal's offset.
    pub fn map_literals(&mut self, literals: &[String]) -> Result<Vec<(String, u32)>, ArenaError> {
        if literals.is_empty() {
            return Ok(Vec::new());
        }
        let mut region = Vec::new();
        let mut relative = Vec::with_capacity(literals.len());
        for lit in literals {
            relative.push(region.len() as u32);
            region.extend_from_slice(lit.as_bytes());
            region.push(0);
        }
        let base = self.arena.append(&region)?;
        Ok(literals
            .iter()
            .zip(relative)
            .map(|(lit, rel)| (lit.clone(), base + rel))
            .collect())
    }

    pub fn add_index(&mut self, index: QueryIndex) -> u64 {
        self.indexes.push(index);
        (self.indexes.len() - 1) as u64
    }

    pub fn index(&self, id: u64) -> Result<&IndexHandle, BackendError> {
        self.indexes
            .get(id as usize)
            .map(|qi| &qi.handle)
            .ok_or(BackendError::UnknownIndex(id))
    }

    /// Looks up an index over `table.column` together with its id.
    pub fn find_index(&self, table: &str, column: &str) -> Option<(u64, &IndexHandle)> {
        self.indexes
            .iter()
            .enumerate()
            .find(|(_, qi)| qi.table == table && qi.column == column)
            .map(|(i, qi)| (i as u64, &qi.handle))
    }

    pub fn indexes(&self) -> &[QueryIndex] {
        &self.indexes
    }

    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn message(&self, id: u64) -> Option<&Message> {
        self.messages.get(id as usize)
    }
}

static REGISTRY: Lazy<Mutex<IntMap<ContextId, Arc<WasmContext>>>> =
    Lazy::new(|| Mutex::new(IntMap::default()));

/// Registers a fully built context; host callbacks can look it up by id
/// from here on.
pub fn register(context: WasmContext) -> Arc<WasmContext> {
    let context = Arc::new(context);
    let _previous = REGISTRY.lock().insert(context.id, context.clone());
    debug_assert!(_previous.is_none(), "context id {} reused", context.id);
    context
}

/// Resolves a context id. Fails with `UnknownContext` if the id is not live,
/// which in a host callback indicates corruption.
pub fn get(id: ContextId) -> Result<Arc<WasmContext>, BackendError> {
    REGISTRY
        .lock()
        .get(&id)
        .cloned()
        .ok_or(BackendError::UnknownContext(id))
}

/// Removes a context from the registry. Returns whether it was live.
pub fn dispose(id: ContextId) -> bool {
    REGISTRY.lock().remove(&id).is_some()
}

/// Number of live contexts; queries must leave this unchanged overall.
pub fn live_contexts() -> usize {
    REGISTRY.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::WASM_PAGE_SIZE;
    use quern_lib::layout::RowMajorFactory;
    use quern_lib::plan::{Operator, PhysicalPlan};
    use quern_lib::store::{Column, RowStore, Table};
    use quern_lib::types::Type;
    use quern_lib::value::Value;

    fn context(id: ContextId) -> WasmContext {
        let table = Arc::new(Table::new("t", vec![Column::new("id", Type::I32)]));
        let mut store = RowStore::new(table);
        store.append(&[Some(Value::Int(1))]).unwrap();
        let plan = Arc::new(PhysicalPlan::new(Operator::scan(Arc::new(store), "t")));
        WasmContext::new(
            id,
            plan,
            ContextConfig::default(),
            16 * WASM_PAGE_SIZE,
            Arc::new(RowMajorFactory),
        )
        .unwrap()
    }

    #[test]
    fn registry_round_trip() {
        let before = live_contexts();
        let ctx = register(context(9001));
        assert_eq!(live_contexts(), before + 1);
        assert_eq!(get(9001).unwrap().id, ctx.id);
        assert!(dispose(9001));
        assert!(!dispose(9001));
        assert_eq!(live_contexts(), before);
        assert!(matches!(get(9001), Err(BackendError::UnknownContext(9001))));
    }

    #[test]
    fn tables_map_once() {
        let mut ctx = context(9002);
        let table = Arc::new(Table::new("u", vec![Column::new("k", Type::I64)]));
        let mut store = RowStore::new(table);
        store.append(&[Some(Value::Int(7))]).unwrap();
        let a = ctx.map_table(&store).unwrap();
        let b = ctx.map_table(&store).unwrap();
        assert_eq!(a, b);
        assert_eq!(ctx.table_offset("u"), Some(a));
    }

    #[test]
    fn literal_region_is_nul_separated() {
        let mut ctx = context(9003);
        let offsets = ctx
            .map_literals(&["alice".to_string(), "bob".to_string()])
            .unwrap();
        for (lit, off) in &offsets {
            let bytes = unsafe { ctx.arena().c_str(*off, 64).unwrap() };
            assert_eq!(bytes, lit.as_bytes());
        }
    }

    #[test]
    fn unknown_index_is_reported() {
        let ctx = context(9004);
        assert!(matches!(ctx.index(3), Err(BackendError::UnknownIndex(3))));
    }
}
