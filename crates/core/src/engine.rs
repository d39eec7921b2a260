//! The engine driver: wasmtime configuration, per-query orchestration, and
//! the arena-backed linear memory.
//!
//! Per query the driver builds the runtime environment (table offsets and
//! row counts as global imports), creates the Wasm context, drives the
//! module builder, instantiates the module with the context's arena
//! installed as the guest's linear memory, invokes `main(ctx_id)`, reports
//! the row count on print sinks, and disposes the context.
//!
//! The memory installation uses the engine's external-memory support: a
//! [`LinearMemory`] implementation over the context arena, served by a
//! custom [`MemoryCreator`] that the driver arms with the current context
//! right before instantiation. Host and guest thereby share one mapping and
//! nothing is copied across the `main` boundary.

use crate::abi::{self, WasmInstanceEnv};
use crate::arena::WASM_PAGE_SIZE;
use crate::codegen::{self, RuntimeEnv, TableBinding};
use crate::config::{BackendOptions, ContextConfig};
use crate::context::{self, ContextId, QueryIndex, WasmContext};
use crate::error::{BackendError, GuestException};
use crate::inspect;
use crate::module::{render_wat, ModuleBuilder, IMPORT_MODULE};
use parking_lot::Mutex;
use quern_lib::layout::RowMajorFactory;
use quern_lib::plan::{Operator, PhysicalPlan};
use std::sync::{Arc, PoisonError};
use std::time::Instant;
use wasm_encoder::ValType;
use wasmtime::{
    Config, Engine, Global, GlobalType, LinearMemory, Linker, MemoryCreator, MemoryType, Module,
    Mutability, OptLevel, Store, Strategy, Val, ValType as WasmValType,
};

/// Canonical name under which this backend registers itself.
pub const BACKEND_NAME: &str = "WasmEngine";

/// Registers the WebAssembly execution backend and hands it back.
pub fn register(options: BackendOptions) -> anyhow::Result<WasmBackend> {
    log::info!("registering backend `{BACKEND_NAME}`: WebAssembly execution via wasmtime");
    WasmBackend::new(options)
}

/// The WebAssembly execution backend. One instance serves queries
/// sequentially; an internal lock takes the place of an engine isolate.
pub struct WasmBackend {
    engine: Engine,
    memories: Arc<ArenaMemories>,
    options: BackendOptions,
    query_lock: Mutex<()>,
}

impl WasmBackend {
    pub fn new(options: BackendOptions) -> anyhow::Result<Self> {
        let memories = Arc::new(ArenaMemories::default());
        let mut config = Config::new();
        config.max_wasm_stack(8 << 20);
        config.cranelift_opt_level(match options.wasm_optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });
        if options.wasm_adaptive {
            // Baseline compilation in place of the optimizing tier; the
            // adaptive trade is compile latency for peak throughput.
            config.strategy(Strategy::Winch);
        }
        if options.wasm_compilation_cache {
            // If the cache cannot be set up that's fine, it's just an
            // optimization.
            let _ = set_cache_config(&mut config);
        }
        config.with_host_memory(memories.clone());
        let engine = Engine::new(&config)?;
        Ok(WasmBackend {
            engine,
            memories,
            options,
            query_lock: Mutex::new(()),
        })
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    /// Compiles a plan to Wasm bytes without executing it.
    pub fn compile(&self, plan: &Arc<PhysicalPlan>) -> Result<Vec<u8>, BackendError> {
        let _guard = self.query_lock.lock();
        let (bytes, _ctx, _env) = self.prepare(plan.clone(), Vec::new())?;
        Ok(bytes)
    }

    pub fn execute(&self, plan: &Arc<PhysicalPlan>) -> Result<u32, BackendError> {
        self.execute_with_indexes(plan, Vec::new())
    }

    /// Executes a plan with the given indexes registered on the query's
    /// context, addressable by id from generated code.
    pub fn execute_with_indexes(
        &self,
        plan: &Arc<PhysicalPlan>,
        indexes: Vec<QueryIndex>,
    ) -> Result<u32, BackendError> {
        let _guard = self.query_lock.lock();

        let wasm_start = Instant::now();
        let (bytes, ctx, env) = self.prepare(plan.clone(), indexes)?;
        if self.options.statistics {
            println!("Compile SQL to WebAssembly: {:?}", wasm_start.elapsed());
            println!("Wasm code size: {}", bytes.len());
        }

        let ctx = context::register(ctx);
        let _dispose = DisposeGuard { id: ctx.id };

        let rows = if self.options.inspector_enabled() {
            let env_json = inspector_env(&ctx, &env);
            inspect::run_inspector(self.options.cdt_port, &bytes, &env_json, ctx.id, || {
                self.run_main(&bytes, &ctx, &env)
            })?
        } else {
            self.run_main(&bytes, &ctx, &env)?
        };

        if !self.options.quiet {
            let out = match plan.matched_root() {
                Operator::Print(op) => Some(&op.out),
                Operator::NoOp(op) => Some(&op.out),
                _ => None,
            };
            if let Some(out) = out {
                let mut out = out.lock().unwrap_or_else(PoisonError::into_inner);
                writeln!(out, "{rows} rows")?;
            }
        }
        Ok(rows)
    }

    /// Runs a previously emitted module against a fully built (but not yet
    /// registered) context. This is the path precompiled modules take.
    pub fn execute_module(
        &self,
        bytes: &[u8],
        ctx: WasmContext,
        env: &RuntimeEnv,
    ) -> Result<u32, BackendError> {
        let _guard = self.query_lock.lock();
        let ctx = context::register(ctx);
        let _dispose = DisposeGuard { id: ctx.id };
        self.run_main(bytes, &ctx, env)
    }

    /// Builds context, environment and module for one query.
    fn prepare(
        &self,
        plan: Arc<PhysicalPlan>,
        indexes: Vec<QueryIndex>,
    ) -> Result<(Vec<u8>, WasmContext, RuntimeEnv), BackendError> {
        let mut builder = ModuleBuilder::new((self.options.vm_size / WASM_PAGE_SIZE) as u64);
        let mut config = ContextConfig::default();
        if !self.options.inspector_enabled() {
            config = config.with(ContextConfig::TRAP_GUARD_PAGES);
        }
        let mut ctx = WasmContext::new(
            builder.id(),
            plan.clone(),
            config,
            self.options.vm_size,
            Arc::new(RowMajorFactory),
        )?;
        for index in indexes {
            ctx.add_index(index);
        }

        let root = plan.matched_root();
        let mut env = RuntimeEnv::default();
        for store in codegen::collect_tables(root) {
            let mem_offset = ctx.map_table(&store)?;
            let name = store.table().name.clone();
            let mem_global = builder.import_global(&format!("{name}_mem"), ValType::I32);
            let rows_global = builder.import_global(&format!("{name}_num_rows"), ValType::I32);
            env.tables.push(TableBinding {
                num_rows: store.num_rows() as u32,
                store,
                mem_global,
                rows_global,
                mem_offset,
            });
        }
        for literal in codegen::collect_string_literals(root) {
            builder.add_literal(&literal);
        }
        let mapped = ctx.map_literals(builder.literals())?;
        for (literal, offset) in &mapped {
            builder.set_literal_offset(literal, *offset);
        }
        env.literals = mapped;

        codegen::compile(&mut builder, &ctx, &env, &self.options)?;

        let bytes = match builder.finish() {
            Ok(bytes) => bytes,
            Err(crate::module::ModuleError::Invalid { error, wat }) => {
                // A code-generator bug; abort the query with the dump.
                log::error!("generated module failed validation: {error}\n{wat}");
                panic!("generated Wasm module failed validation: {error}");
            }
            Err(e) => panic!("module builder: {e}"),
        };
        if self.options.wasm_dump {
            println!("{}", render_wat(&bytes));
        }
        ctx.set_messages(builder.take_messages());
        Ok((bytes, ctx, env))
    }

    fn run_main(
        &self,
        bytes: &[u8],
        ctx: &Arc<WasmContext>,
        env: &RuntimeEnv,
    ) -> Result<u32, BackendError> {
        let machine_start = Instant::now();
        let module = Module::new(&self.engine, bytes).map_err(BackendError::Compile)?;
        if self.options.statistics {
            println!(
                "Compile WebAssembly to machine code: {:?}",
                machine_start.elapsed()
            );
        }
        if self.options.asm_dump {
            // The engine offers no textual machine-code dump; report the
            // serialized artifact size and leave the WAT to `wasm_dump`.
            match module.serialize() {
                Ok(art) => println!("Machine code size: {}", art.len()),
                Err(e) => log::warn!("cannot serialize compiled module: {e}"),
            }
        }

        self.memories.arm(ctx.clone());
        let _disarm = DisarmGuard(&self.memories);
        log::debug!(
            "setting Wasm instance raw memory to the VM of context {} at {:p} of {} bytes",
            ctx.id,
            ctx.arena().base(),
            ctx.arena().size()
        );

        let mut store = Store::new(&self.engine, WasmInstanceEnv::new(ctx.id));
        let mut linker = Linker::new(&self.engine);
        abi::link_imports(&mut linker).map_err(BackendError::Instantiate)?;
        for table in &env.tables {
            let name = &table.store.table().name;
            define_const_global(
                &mut store,
                &mut linker,
                &format!("{name}_mem"),
                table.mem_offset as i32,
            )?;
            define_const_global(
                &mut store,
                &mut linker,
                &format!("{name}_num_rows"),
                table.num_rows as i32,
            )?;
        }

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(BackendError::Instantiate)?;
        if let Some(memory) = instance.get_memory(&mut store, "memory") {
            debug_assert_eq!(
                memory.data_ptr(&store),
                ctx.arena().base(),
                "instance memory must alias the context arena"
            );
        }

        let main = instance
            .get_typed_func::<i32, u32>(&mut store, "main")
            .map_err(BackendError::Instantiate)?;

        let execute_start = Instant::now();
        let rows = main.call(&mut store, ctx.id as i32).map_err(|err| {
            log_traceback("query", "main", &err);
            match err.downcast::<GuestException>() {
                Ok(exc) => BackendError::Guest(exc),
                Err(err) => BackendError::Trap(err),
            }
        })?;
        if self.options.statistics {
            println!("Execute machine code: {:?}", execute_start.elapsed());
        }
        Ok(rows)
    }
}

fn define_const_global(
    store: &mut Store<WasmInstanceEnv>,
    linker: &mut Linker<WasmInstanceEnv>,
    name: &str,
    value: i32,
) -> Result<(), BackendError> {
    let global = Global::new(
        &mut *store,
        GlobalType::new(WasmValType::I32, Mutability::Const),
        Val::I32(value),
    )
    .map_err(BackendError::Instantiate)?;
    linker
        .define(&*store, IMPORT_MODULE, name, global)
        .map_err(BackendError::Instantiate)?;
    Ok(())
}

fn log_traceback(what: &str, func: &str, e: &anyhow::Error) {
    log::info!("{what} \"{func}\" runtime error: {e:#}");
    if let Some(bt) = e.downcast_ref::<wasmtime::WasmBacktrace>() {
        let frames = bt.frames();
        for (i, frame) in frames.iter().enumerate() {
            log::info!(
                "  Frame #{}: {}",
                frames.len() - i,
                frame.func_name().unwrap_or("<unknown>")
            );
        }
    }
}

/// Engine cache configuration, written through a transient TOML file the
/// way the engine expects it.
fn set_cache_config(config: &mut Config) -> anyhow::Result<()> {
    use std::io::Write;
    let directory = std::env::temp_dir().join("quern-wasmtime-cache");
    let cache_config = toml::toml! {
        [cache]
        enabled = true
        directory = (toml::Value::try_from(&directory)?)
    };
    let tmpfile = tempfile::NamedTempFile::new()?;
    write!(&tmpfile, "{cache_config}")?;
    config.cache_config_load(tmpfile.path())?;
    Ok(())
}

/// JSON rendition of the runtime environment for the inspector bootstrap.
fn inspector_env(ctx: &WasmContext, env: &RuntimeEnv) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for table in &env.tables {
        let name = &table.store.table().name;
        map.insert(format!("{name}_mem"), table.mem_offset.into());
        map.insert(format!("{name}_num_rows"), table.num_rows.into());
    }
    for (literal, offset) in &env.literals {
        map.insert(format!("literal:{literal}"), (*offset).into());
    }
    for (id, index) in ctx.indexes().iter().enumerate() {
        map.insert(
            format!("index:{}.{}", index.table, index.column),
            (id as u64).into(),
        );
    }
    map
}

struct DisposeGuard {
    id: ContextId,
}

impl Drop for DisposeGuard {
    fn drop(&mut self) {
        context::dispose(self.id);
    }
}

struct DisarmGuard<'a>(&'a ArenaMemories);

impl Drop for DisarmGuard<'_> {
    fn drop(&mut self) {
        self.0.disarm();
    }
}

/// Serves the armed context's arena as the linear memory of the next
/// instantiation.
#[derive(Default)]
struct ArenaMemories {
    armed: Mutex<Option<Arc<WasmContext>>>,
}

impl ArenaMemories {
    fn arm(&self, ctx: Arc<WasmContext>) {
        *self.armed.lock() = Some(ctx);
    }

    fn disarm(&self) {
        *self.armed.lock() = None;
    }
}

unsafe impl MemoryCreator for ArenaMemories {
    fn new_memory(
        &self,
        _ty: MemoryType,
        minimum: usize,
        maximum: Option<usize>,
        _reserved_size_in_bytes: Option<usize>,
        _guard_size_in_bytes: usize,
    ) -> Result<Box<dyn LinearMemory>, String> {
        let ctx = self
            .armed
            .lock()
            .clone()
            .ok_or_else(|| "no Wasm context armed for memory creation".to_string())?;
        let size = ctx.arena().size();
        if minimum > size || maximum.is_some_and(|max| max < size) {
            return Err(format!(
                "arena of {size} bytes cannot back a memory of [{minimum}, {maximum:?}] bytes"
            ));
        }
        Ok(Box::new(ArenaLinearMemory { ctx }))
    }
}

struct ArenaLinearMemory {
    ctx: Arc<WasmContext>,
}

// SAFETY: the arena outlives the memory (the Arc keeps the context alive),
// its base pointer is stable, and the backend serializes all access to it.
unsafe impl LinearMemory for ArenaLinearMemory {
    fn byte_size(&self) -> usize {
        self.ctx.arena().size()
    }

    fn maximum_byte_size(&self) -> Option<usize> {
        Some(self.ctx.arena().size())
    }

    fn grow_to(&mut self, new_size: usize) -> anyhow::Result<()> {
        anyhow::ensure!(
            new_size <= self.ctx.arena().size(),
            "the arena-backed linear memory cannot grow past its reservation"
        );
        Ok(())
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ctx.arena().base()
    }

    fn wasm_accessible(&self) -> std::ops::Range<usize> {
        let base = self.ctx.arena().base() as usize;
        base..base + self.ctx.arena().size()
    }
}
