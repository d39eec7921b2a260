//! Lowering of matched physical plans into the Wasm module.
//!
//! The generator emits two functions: `run`, whose body is the fused
//! pipeline loop, and the exported `main(ctx_id) -> u32`, which calls `run`,
//! optionally reports allocator counters, and returns the number of result
//! tuples. Pipelines of the shape scan → filters → projection → limit →
//! sink are lowered here; the remaining operator kinds belong to the
//! optimizer's emitter library and are rejected with a typed error.
//!
//! Result rows are written to a buffer bump-allocated from the guest heap,
//! laid out by the context's result-set factory over the payload schema
//! (deduplicated, constant-free); the root sink then hands `(offset, count)`
//! to the `read_result_set` host callback. Purely constant result sets pass
//! offset zero and write nothing.

use crate::abi::AbiImports;
use crate::config::BackendOptions;
use crate::context::WasmContext;
use crate::module::{GlobalInit, ModuleBuilder};
use quern_lib::expr::{BinOp, Cnf, Expr, UnOp};
use quern_lib::layout::DataLayout;
use quern_lib::plan::{Operator, ProjectionOp, ScanOp};
use quern_lib::schema::Schema;
use quern_lib::store::RowStore;
use quern_lib::types::Type;
use quern_lib::value::Value;
use quern_lib::index::{IndexKind, KeyType, SeekBound};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use wasm_encoder::{BlockType, Function, Instruction, MemArg, ValType};

#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("plan root is not a sink operator but `{0}`")]
    RootNotSink(&'static str),
    #[error("operator `{0}` has no pipeline lowering in this backend")]
    UnsupportedPipeline(&'static str),
    #[error("expression not supported by the code generator: {0}")]
    UnsupportedExpression(String),
    #[error("designator `{0}` does not resolve to a scanned column")]
    UnresolvedColumn(String),
    #[error("operand types {0} and {1} do not agree")]
    OperandMismatch(Type, Type),
    #[error("string literal `{0}` was not mapped into the arena")]
    UnmappedLiteral(String),
    #[error("query needs {needed} bytes of guest memory but only {available} remain")]
    OutOfGuestMemory { needed: usize, available: usize },
}

/// Per-query bindings the driver passes to code generation and, later, to
/// module instantiation: one entry per mapped base table plus the mapped
/// string literals.
#[derive(Default)]
pub struct RuntimeEnv {
    pub tables: Vec<TableBinding>,
    pub literals: Vec<(String, u32)>,
}

pub struct TableBinding {
    pub store: Arc<RowStore>,
    /// Index of the imported `<name>_mem` global.
    pub mem_global: u32,
    /// Index of the imported `<name>_num_rows` global.
    pub rows_global: u32,
    pub mem_offset: u32,
    pub num_rows: u32,
}

impl RuntimeEnv {
    pub fn table(&self, name: &str) -> Option<&TableBinding> {
        self.tables.iter().find(|t| t.store.table().name == name)
    }
}

/// Collects every string literal occurring in the plan's filters, join
/// predicates, projections and grouping keys, deduplicated in first-seen
/// order.
pub fn collect_string_literals(root: &Operator) -> Vec<String> {
    fn walk<'a>(op: &'a Operator, out: &mut Vec<&'a str>) {
        match op {
            Operator::Filter(f) => f.filter.collect_strings(out),
            Operator::DisjunctiveFilter(f) => f.filter.collect_strings(out),
            Operator::Join(j) => j.predicate.collect_strings(out),
            Operator::Projection(p) => {
                for (expr, _) in &p.projections {
                    expr.collect_strings(out);
                }
            }
            Operator::Grouping(g) => {
                for (expr, _) in &g.group_by {
                    expr.collect_strings(out);
                }
            }
            _ => {}
        }
        for child in op.children() {
            walk(child, out);
        }
    }
    let mut raw = Vec::new();
    walk(root, &mut raw);
    let mut seen = HashSet::new();
    raw.into_iter()
        .filter(|s| seen.insert(*s))
        .map(str::to_owned)
        .collect()
}

/// Collects every base table referenced by a scan, deduplicated by name.
pub fn collect_tables(root: &Operator) -> Vec<Arc<RowStore>> {
    fn walk(op: &Operator, out: &mut Vec<Arc<RowStore>>, seen: &mut HashSet<String>) {
        if let Operator::Scan(scan) = op {
            if seen.insert(scan.store.table().name.clone()) {
                out.push(scan.store.clone());
            }
        }
        for child in op.children() {
            walk(child, out, seen);
        }
    }
    let mut out = Vec::new();
    walk(root, &mut out, &mut HashSet::new());
    out
}

/* ---------------------------------------------------------------------- */

const fn memarg(offset: u64) -> MemArg {
    MemArg {
        offset,
        align: 0,
        memory_index: 0,
    }
}

/// Builds one function body: locals on demand, instruction stream, and a
/// running count of open blocks so branch targets can be addressed by level
/// instead of by relative depth.
struct FnBuilder {
    params: u32,
    locals: Vec<ValType>,
    insns: Vec<Instruction<'static>>,
    open_blocks: u32,
}

impl FnBuilder {
    fn new(params: u32) -> Self {
        FnBuilder {
            params,
            locals: Vec::new(),
            insns: Vec::new(),
            open_blocks: 0,
        }
    }

    fn local(&mut self, ty: ValType) -> u32 {
        self.locals.push(ty);
        self.params + self.locals.len() as u32 - 1
    }

    fn ins(&mut self, i: Instruction<'static>) -> &mut Self {
        match i {
            Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => {
                self.open_blocks += 1
            }
            Instruction::End => self.open_blocks -= 1,
            _ => {}
        }
        self.insns.push(i);
        self
    }

    /// Branch to the block opened at nesting `level` (0 = outermost).
    fn br_to(&mut self, level: u32) -> &mut Self {
        let depth = self.open_blocks - 1 - level;
        self.ins(Instruction::Br(depth))
    }

    fn br_if_to(&mut self, level: u32) -> &mut Self {
        let depth = self.open_blocks - 1 - level;
        self.ins(Instruction::BrIf(depth))
    }

    fn finish(mut self) -> Function {
        self.insns.push(Instruction::End);
        let mut f = Function::new(self.locals.into_iter().map(|ty| (1u32, ty)));
        for i in &self.insns {
            f.instruction(i);
        }
        f
    }
}

/// How an expression's value lives on the Wasm stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emitted {
    I32,
    I64,
    F32,
    F64,
    /// An `i32` address of NUL-terminated character data, with the byte
    /// count a copy of it occupies (including the NUL).
    Ptr { copy_len: u32 },
}

fn emitted_of(ty: Type) -> Result<Emitted, CodegenError> {
    Ok(match ty {
        Type::Bool | Type::I8 | Type::I16 | Type::I32 | Type::Date => Emitted::I32,
        Type::I64 | Type::Decimal { .. } | Type::DateTime => Emitted::I64,
        Type::F32 => Emitted::F32,
        Type::F64 => Emitted::F64,
        Type::Char(n) => Emitted::Ptr {
            copy_len: n as u32 + 1,
        },
        Type::None => {
            return Err(CodegenError::UnsupportedExpression(
                "NULL inside a computed expression".into(),
            ))
        }
    })
}

/* ---------------------------------------------------------------------- */

/// The shape of the single pipeline this backend lowers itself.
struct PipelineShape<'a> {
    root: RootKind,
    limit: Option<(u32, u32)>,
    /// Filters in application order (closest to the scan first), with a
    /// marker telling whether they sit above the projection.
    filters: Vec<(&'a Cnf, bool)>,
    projection: Option<&'a ProjectionOp>,
    scan: Option<&'a ScanOp>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RootKind {
    Print,
    Callback,
    NoOp,
}

fn analyze(root: &Operator) -> Result<PipelineShape<'_>, CodegenError> {
    let (kind, mut cur) = match root {
        Operator::Print(op) => (RootKind::Print, op.child.as_ref()),
        Operator::Callback(op) => (RootKind::Callback, op.child.as_ref()),
        Operator::NoOp(op) => (RootKind::NoOp, op.child.as_ref()),
        other => return Err(CodegenError::RootNotSink(other.name())),
    };
    let mut shape = PipelineShape {
        root: kind,
        limit: None,
        filters: Vec::new(),
        projection: None,
        scan: None,
    };
    loop {
        match cur {
            Operator::Limit(op) => {
                if shape.limit.is_some() || shape.projection.is_some() {
                    return Err(CodegenError::UnsupportedPipeline("Limit"));
                }
                shape.limit = Some((op.limit as u32, op.offset as u32));
                cur = op.child.as_ref();
            }
            Operator::Projection(op) => {
                if shape.projection.is_some() {
                    return Err(CodegenError::UnsupportedPipeline("Projection"));
                }
                shape.projection = Some(op);
                match &op.child {
                    Some(child) => cur = child.as_ref(),
                    None => break,
                }
            }
            Operator::Filter(op) => {
                shape.filters.push((&op.filter, shape.projection.is_none()));
                cur = op.child.as_ref();
            }
            Operator::DisjunctiveFilter(op) => {
                shape.filters.push((&op.filter, shape.projection.is_none()));
                cur = op.child.as_ref();
            }
            Operator::Scan(op) => {
                shape.scan = Some(op);
                break;
            }
            other => return Err(CodegenError::UnsupportedPipeline(other.name())),
        }
    }
    // Descent found the filters top-down; application order is bottom-up.
    // The marker recorded whether the projection had been seen yet, i.e.
    // whether the filter is *above* it in the tree.
    shape.filters.reverse();
    for (_, below) in &mut shape.filters {
        *below = !*below;
    }
    Ok(shape)
}

/* ---------------------------------------------------------------------- */

/// One equality predicate an index can answer.
struct IndexProbe {
    index_id: u64,
    kind: IndexKind,
    key_type: KeyType,
    key: Value,
    /// (filter, clause) position of the predicate this probe replaces.
    consumed: (usize, usize),
}

pub fn compile(
    builder: &mut ModuleBuilder,
    ctx: &WasmContext,
    env: &RuntimeEnv,
    options: &BackendOptions,
) -> Result<(), CodegenError> {
    let abi = AbiImports::register(builder);
    let mut cg = CodeGen {
        builder,
        ctx,
        env,
        abi,
        streq: None,
        statistics: options.statistics,
    };
    cg.compile_plan()
}

struct CodeGen<'a> {
    builder: &'a mut ModuleBuilder,
    ctx: &'a WasmContext,
    env: &'a RuntimeEnv,
    abi: AbiImports,
    streq: Option<u32>,
    statistics: bool,
}

/// Everything the row loop needs to know about the scanned table.
struct ScanBinding<'a> {
    schema: &'a Schema,
    layout: &'a DataLayout,
    table_name: String,
    mem_global: u32,
    rows_global: u32,
    num_rows: u32,
}

impl<'a> CodeGen<'a> {
    fn compile_plan(&mut self) -> Result<(), CodegenError> {
        let plan = self.ctx.plan().clone();
        let root = plan.matched_root();
        let shape = analyze(root)?;

        let root_schema = root.schema();
        let payload = root_schema.deduplicate().drop_constants();
        let payload_layout = self.ctx.result_set_factory().make(&payload);

        // Resolve every filter predicate and payload column down to
        // scan-rooted expressions.
        let resolved_filters = shape
            .filters
            .iter()
            .map(|(cnf, below)| {
                cnf.0
                    .iter()
                    .map(|clause| {
                        clause
                            .0
                            .iter()
                            .map(|pred| {
                                if *below {
                                    Ok(pred.clone())
                                } else {
                                    substitute(pred, shape.projection)
                                }
                            })
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<Vec<Vec<Expr>>>, _>>()?;

        let payload_exprs = payload
            .iter()
            .map(|entry| payload_source(&entry.id, entry.ty, shape.projection))
            .collect::<Vec<Expr>>();

        let scan = match shape.scan {
            Some(scan) => {
                let name = &scan.store.table().name;
                let binding = self
                    .env
                    .table(name)
                    .unwrap_or_else(|| unreachable!("table `{name}` was not mapped"));
                Some(ScanBinding {
                    schema: &scan.schema,
                    layout: scan.store.layout(),
                    table_name: name.clone(),
                    mem_global: binding.mem_global,
                    rows_global: binding.rows_global,
                    num_rows: binding.num_rows,
                })
            }
            None => None,
        };

        // Guest-heap placement: result buffer first, then the tuple-id
        // scratch buffer of an index probe.
        let heap_base = self.ctx.arena().guest_heap_base();
        let max_rows = scan.as_ref().map_or(1, |s| s.num_rows);
        let result_bytes = if payload.is_empty() {
            0
        } else {
            payload_layout.stride * max_rows as usize
        };
        let buf_base = if payload.is_empty() { 0 } else { heap_base as u32 };
        let id_buf_base = (heap_base + result_bytes).next_multiple_of(4);
        let id_buf_bytes = 4 * max_rows as usize;

        let probe = match &scan {
            Some(s) => self.find_index_probe(s, &resolved_filters)?,
            None => None,
        };
        let needed =
            result_bytes + if probe.is_some() { id_buf_bytes } else { 0 };
        let available = self.ctx.arena().size().saturating_sub(heap_base);
        if needed > available {
            return Err(CodegenError::OutOfGuestMemory { needed, available });
        }
        self.builder.track_preallocation(needed as u32);

        // `streq` is only defined when some string comparison needs it.
        let needs_streq = resolved_filters
            .iter()
            .flatten()
            .flatten()
            .chain(payload_exprs.iter())
            .any(expr_compares_strings);
        let run = self
            .builder
            .reserve_func(&[], &[]);
        let main = self
            .builder
            .reserve_func(&[ValType::I32], &[ValType::I32]);
        if needs_streq {
            let idx = self
                .builder
                .reserve_func(&[ValType::I32, ValType::I32], &[ValType::I32]);
            self.streq = Some(idx);
        }
        let num_tuples = self.builder.define_global(true, GlobalInit::I32(0));

        let run_body = self.emit_run(
            &shape,
            scan.as_ref(),
            &resolved_filters,
            &payload_exprs,
            &payload,
            &payload_layout,
            buf_base,
            id_buf_base as u32,
            probe,
            num_tuples,
        )?;
        self.builder.set_body(run, run_body);

        let main_body = self.emit_main(run, num_tuples);
        self.builder.set_body(main, main_body);
        self.builder.export_func(main, "main");

        if let Some(streq) = self.streq {
            self.builder.set_body(streq, emit_streq());
        }
        Ok(())
    }

    fn emit_main(&mut self, run: u32, num_tuples: u32) -> Function {
        let mut f = FnBuilder::new(1);
        f.ins(Instruction::Call(run));
        if self.statistics {
            let bytes = self.builder.preallocated_bytes();
            f.ins(Instruction::I32Const(bytes as i32))
                .ins(Instruction::I32Const(bytes as i32))
                .ins(Instruction::Call(self.abi.print_memory_consumption));
        }
        f.ins(Instruction::GlobalGet(num_tuples));
        f.finish()
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_run(
        &mut self,
        shape: &PipelineShape<'_>,
        scan: Option<&ScanBinding<'_>>,
        filters: &[Vec<Vec<Expr>>],
        payload_exprs: &[Expr],
        payload: &Schema,
        payload_layout: &DataLayout,
        buf_base: u32,
        id_buf_base: u32,
        probe: Option<IndexProbe>,
        num_tuples: u32,
    ) -> Result<Function, CodegenError> {
        let mut f = FnBuilder::new(0);

        let Some(scan) = scan else {
            // No producer: the projection itself yields a single row of
            // constants (or none once limit/offset are applied).
            let mut count: u32 = 1;
            if let Some((limit, offset)) = shape.limit {
                count = if offset >= 1 { 0 } else { count.min(limit) };
            }
            f.ins(Instruction::I32Const(count as i32))
                .ins(Instruction::GlobalSet(num_tuples));
            if shape.root != RootKind::NoOp {
                f.ins(Instruction::I32Const(0))
                    .ins(Instruction::I32Const(count as i32))
                    .ins(Instruction::Call(self.abi.read_result_set));
            }
            return Ok(f.finish());
        };

        let i = f.local(ValType::I32);
        let out = f.local(ValType::I32);
        let row = f.local(ValType::I32);
        let out_addr = f.local(ValType::I32);
        let skipped = f.local(ValType::I32);

        // Index probe prologue: seek both bounds, then batch-fetch the
        // matching tuple ids into the scratch buffer.
        let loop_bound = if let Some(probe) = &probe {
            let lo = f.local(ValType::I32);
            let n = f.local(ValType::I32);
            let seek_lower = self.abi.seek(probe.kind, probe.key_type, SeekBound::Lower);
            let seek_upper = self.abi.seek(probe.kind, probe.key_type, SeekBound::Upper);
            let scan_fn = self.abi.scan(probe.kind, probe.key_type);

            f.ins(Instruction::I64Const(probe.index_id as i64));
            self.emit_key(&mut f, probe.key_type, &probe.key)?;
            f.ins(Instruction::Call(seek_lower))
                .ins(Instruction::LocalSet(lo));

            f.ins(Instruction::I64Const(probe.index_id as i64));
            self.emit_key(&mut f, probe.key_type, &probe.key)?;
            f.ins(Instruction::Call(seek_upper))
                .ins(Instruction::LocalGet(lo))
                .ins(Instruction::I32Sub)
                .ins(Instruction::LocalSet(n));

            f.ins(Instruction::I64Const(probe.index_id as i64))
                .ins(Instruction::LocalGet(lo))
                .ins(Instruction::I32Const(id_buf_base as i32))
                .ins(Instruction::LocalGet(n))
                .ins(Instruction::Call(scan_fn));
            LoopBound::Local(n)
        } else {
            LoopBound::Global(scan.rows_global)
        };

        const EXIT: u32 = 0;
        const TOP: u32 = 1;
        const NEXT: u32 = 2;
        f.ins(Instruction::Block(BlockType::Empty)); // EXIT
        f.ins(Instruction::Loop(BlockType::Empty)); // TOP
        f.ins(Instruction::Block(BlockType::Empty)); // NEXT

        // while i < bound
        f.ins(Instruction::LocalGet(i));
        match loop_bound {
            LoopBound::Local(n) => f.ins(Instruction::LocalGet(n)),
            LoopBound::Global(g) => f.ins(Instruction::GlobalGet(g)),
        };
        f.ins(Instruction::I32GeU).br_if_to(EXIT);

        // row := <table>_mem + row_id * stride
        f.ins(Instruction::GlobalGet(scan.mem_global));
        if probe.is_some() {
            f.ins(Instruction::I32Const(id_buf_base as i32))
                .ins(Instruction::LocalGet(i))
                .ins(Instruction::I32Const(4))
                .ins(Instruction::I32Mul)
                .ins(Instruction::I32Add)
                .ins(Instruction::I32Load(memarg(0)));
        } else {
            f.ins(Instruction::LocalGet(i));
        }
        f.ins(Instruction::I32Const(scan.layout.stride as i32))
            .ins(Instruction::I32Mul)
            .ins(Instruction::I32Add)
            .ins(Instruction::LocalSet(row));

        // Filters: any failing clause skips the row.
        let consumed = probe.as_ref().map(|p| p.consumed);
        for (fi, clauses) in filters.iter().enumerate() {
            for (ci, clause) in clauses.iter().enumerate() {
                if consumed == Some((fi, ci)) {
                    continue;
                }
                self.emit_clause(&mut f, clause, scan, row)?;
                f.ins(Instruction::I32Eqz).br_if_to(NEXT);
            }
        }

        if let Some((limit, offset)) = shape.limit {
            if offset > 0 {
                f.ins(Instruction::LocalGet(skipped))
                    .ins(Instruction::I32Const(offset as i32))
                    .ins(Instruction::I32LtU)
                    .ins(Instruction::If(BlockType::Empty))
                    .ins(Instruction::LocalGet(skipped))
                    .ins(Instruction::I32Const(1))
                    .ins(Instruction::I32Add)
                    .ins(Instruction::LocalSet(skipped))
                    .br_to(NEXT)
                    .ins(Instruction::End);
            }
            f.ins(Instruction::LocalGet(out))
                .ins(Instruction::I32Const(limit as i32))
                .ins(Instruction::I32GeU)
                .br_if_to(EXIT);
        }

        if !payload.is_empty() {
            // out_addr := buf_base + out * stride
            f.ins(Instruction::I32Const(buf_base as i32))
                .ins(Instruction::LocalGet(out))
                .ins(Instruction::I32Const(payload_layout.stride as i32))
                .ins(Instruction::I32Mul)
                .ins(Instruction::I32Add)
                .ins(Instruction::LocalSet(out_addr));
            for (j, (entry, expr)) in payload.iter().zip(payload_exprs).enumerate() {
                self.emit_payload_store(
                    &mut f,
                    j,
                    entry.ty,
                    expr,
                    scan,
                    payload_layout,
                    row,
                    out_addr,
                )?;
            }
        }

        // out += 1
        f.ins(Instruction::LocalGet(out))
            .ins(Instruction::I32Const(1))
            .ins(Instruction::I32Add)
            .ins(Instruction::LocalSet(out));

        f.ins(Instruction::End); // NEXT
        f.ins(Instruction::LocalGet(i))
            .ins(Instruction::I32Const(1))
            .ins(Instruction::I32Add)
            .ins(Instruction::LocalSet(i));
        f.br_to(TOP);
        f.ins(Instruction::End); // TOP
        f.ins(Instruction::End); // EXIT

        // The loop can never produce more rows than the scan has; if it
        // does, the result buffer has been overrun.
        let overflow_msg = self
            .builder
            .add_message(format!("result buffer of `{}` overrun", scan.table_name));
        f.ins(Instruction::LocalGet(out))
            .ins(Instruction::I32Const(scan.num_rows as i32))
            .ins(Instruction::I32GtU)
            .ins(Instruction::If(BlockType::Empty))
            .ins(Instruction::I64Const(overflow_msg as i64))
            .ins(Instruction::Call(self.abi.insist))
            .ins(Instruction::End);

        f.ins(Instruction::LocalGet(out))
            .ins(Instruction::GlobalSet(num_tuples));

        if shape.root != RootKind::NoOp {
            f.ins(Instruction::I32Const(buf_base as i32))
                .ins(Instruction::LocalGet(out))
                .ins(Instruction::Call(self.abi.read_result_set));
        }
        Ok(f.finish())
    }

    /// Emits one disjunctive clause as an `i32` truth value.
    fn emit_clause(
        &mut self,
        f: &mut FnBuilder,
        clause: &[Expr],
        scan: &ScanBinding<'_>,
        row: u32,
    ) -> Result<(), CodegenError> {
        for (d, pred) in clause.iter().enumerate() {
            self.emit_predicate(f, pred, scan, row)?;
            if d > 0 {
                f.ins(Instruction::I32Or);
            }
        }
        if clause.is_empty() {
            f.ins(Instruction::I32Const(0));
        }
        Ok(())
    }

    /// One predicate: NULL in any referenced column makes it false.
    fn emit_predicate(
        &mut self,
        f: &mut FnBuilder,
        pred: &Expr,
        scan: &ScanBinding<'_>,
        row: u32,
    ) -> Result<(), CodegenError> {
        let mut cols = Vec::new();
        collect_columns(pred, scan, &mut cols)?;
        cols.sort_unstable();
        cols.dedup();
        self.emit_value(f, pred, scan, row)?;
        for col in cols {
            let byte = scan.layout.null_bitmap_offset + col / 8;
            f.ins(Instruction::LocalGet(row))
                .ins(Instruction::I32Load8U(memarg(byte as u64)))
                .ins(Instruction::I32Const(1 << (col % 8)))
                .ins(Instruction::I32And)
                .ins(Instruction::I32Eqz)
                .ins(Instruction::I32And);
        }
        Ok(())
    }

    /// Emits `expr`'s value onto the stack; returns how it is represented.
    fn emit_value(
        &mut self,
        f: &mut FnBuilder,
        expr: &Expr,
        scan: &ScanBinding<'_>,
        row: u32,
    ) -> Result<Emitted, CodegenError> {
        match expr {
            Expr::Column { id, .. } => {
                let (col, entry) = scan
                    .schema
                    .find(id)
                    .ok_or_else(|| CodegenError::UnresolvedColumn(id.clone()))?;
                let off = scan.layout.slots[col].offset as u64;
                let emitted = emitted_of(entry.ty)?;
                match entry.ty {
                    Type::Bool => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::I32Load8U(memarg(off)));
                    }
                    Type::I8 => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::I32Load8S(memarg(off)));
                    }
                    Type::I16 => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::I32Load16S(memarg(off)));
                    }
                    Type::I32 | Type::Date => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::I32Load(memarg(off)));
                    }
                    Type::I64 | Type::Decimal { .. } | Type::DateTime => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::I64Load(memarg(off)));
                    }
                    Type::F32 => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::F32Load(memarg(off)));
                    }
                    Type::F64 => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::F64Load(memarg(off)));
                    }
                    Type::Char(_) => {
                        f.ins(Instruction::LocalGet(row))
                            .ins(Instruction::I32Const(off as i32))
                            .ins(Instruction::I32Add);
                    }
                    Type::None => unreachable!("no column has type NONE"),
                }
                Ok(emitted)
            }
            Expr::Constant { value, ty } => self.emit_constant(f, value.as_ref(), *ty),
            Expr::Unary { op, expr, .. } => {
                match op {
                    UnOp::Not => {
                        let e = self.emit_value(f, expr, scan, row)?;
                        if e != Emitted::I32 {
                            return Err(CodegenError::UnsupportedExpression(
                                "NOT over a non-boolean".into(),
                            ));
                        }
                        f.ins(Instruction::I32Eqz);
                        Ok(Emitted::I32)
                    }
                    UnOp::Neg => {
                        let e = emitted_of(expr.ty())?;
                        match e {
                            Emitted::I32 => {
                                f.ins(Instruction::I32Const(0));
                                self.emit_value(f, expr, scan, row)?;
                                f.ins(Instruction::I32Sub);
                            }
                            Emitted::I64 => {
                                f.ins(Instruction::I64Const(0));
                                self.emit_value(f, expr, scan, row)?;
                                f.ins(Instruction::I64Sub);
                            }
                            Emitted::F32 => {
                                self.emit_value(f, expr, scan, row)?;
                                f.ins(Instruction::F32Neg);
                            }
                            Emitted::F64 => {
                                self.emit_value(f, expr, scan, row)?;
                                f.ins(Instruction::F64Neg);
                            }
                            Emitted::Ptr { .. } => {
                                return Err(CodegenError::UnsupportedExpression(
                                    "negated character sequence".into(),
                                ))
                            }
                        }
                        Ok(e)
                    }
                }
            }
            Expr::Binary { op, lhs, rhs, .. } => self.emit_binary(f, *op, lhs, rhs, scan, row),
        }
    }

    fn emit_constant(
        &mut self,
        f: &mut FnBuilder,
        value: Option<&Value>,
        ty: Type,
    ) -> Result<Emitted, CodegenError> {
        let emitted = emitted_of(ty)?;
        let value = value.ok_or_else(|| {
            CodegenError::UnsupportedExpression("non-NULL constant without a value".into())
        })?;
        match (emitted, value) {
            (Emitted::I32, Value::Int(v)) => {
                f.ins(Instruction::I32Const(*v as i32));
            }
            (Emitted::I32, Value::Bool(b)) => {
                f.ins(Instruction::I32Const(*b as i32));
            }
            (Emitted::I32, Value::Date(d)) => {
                f.ins(Instruction::I32Const(*d));
            }
            (Emitted::I64, Value::Int(v)) => {
                f.ins(Instruction::I64Const(*v));
            }
            (Emitted::I64, Value::DateTime(t)) => {
                f.ins(Instruction::I64Const(*t));
            }
            (Emitted::F32, Value::Float(v)) => {
                f.ins(Instruction::F32Const(*v as f32));
            }
            (Emitted::F64, Value::Float(v)) => {
                f.ins(Instruction::F64Const(*v));
            }
            (Emitted::Ptr { .. }, Value::Str(s)) => {
                let off = self
                    .builder
                    .literal_offset(s)
                    .ok_or_else(|| CodegenError::UnmappedLiteral(s.clone()))?;
                f.ins(Instruction::I32Const(off as i32));
                return Ok(Emitted::Ptr {
                    copy_len: s.len() as u32 + 1,
                });
            }
            _ => {
                return Err(CodegenError::UnsupportedExpression(format!(
                    "constant {value:?} of type {ty}"
                )))
            }
        }
        Ok(emitted)
    }

    fn emit_binary(
        &mut self,
        f: &mut FnBuilder,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        scan: &ScanBinding<'_>,
        row: u32,
    ) -> Result<Emitted, CodegenError> {
        let lty = emitted_of(lhs.ty())?;
        let rty = emitted_of(rhs.ty())?;
        let common = common_width(lty, rty)
            .ok_or(CodegenError::OperandMismatch(lhs.ty(), rhs.ty()))?;

        if let Emitted::Ptr { .. } = common {
            if !matches!(op, BinOp::Eq | BinOp::Ne) {
                return Err(CodegenError::UnsupportedExpression(
                    "ordering comparison over character sequences".into(),
                ));
            }
            let streq = self
                .streq
                .unwrap_or_else(|| unreachable!("streq reserved for string comparisons"));
            self.emit_value(f, lhs, scan, row)?;
            self.emit_value(f, rhs, scan, row)?;
            f.ins(Instruction::Call(streq));
            if op == BinOp::Ne {
                f.ins(Instruction::I32Eqz);
            }
            return Ok(Emitted::I32);
        }

        let got = self.emit_value(f, lhs, scan, row)?;
        widen(f, got, common);
        if op == BinOp::Div && matches!(common, Emitted::I32 | Emitted::I64) {
            // Guard the divisor before dividing.
            let scratch = f.local(valtype_of(common));
            let got = self.emit_value(f, rhs, scan, row)?;
            widen(f, got, common);
            f.ins(Instruction::LocalTee(scratch));
            match common {
                Emitted::I32 => f.ins(Instruction::I32Eqz),
                _ => f.ins(Instruction::I64Eqz),
            };
            let msg = self.builder.add_message("division by zero");
            f.ins(Instruction::If(BlockType::Empty))
                .ins(Instruction::I64Const(
                    crate::error::ExceptionKind::DivisionByZero as i64,
                ))
                .ins(Instruction::I64Const(msg as i64))
                .ins(Instruction::Call(self.abi.throw))
                .ins(Instruction::End)
                .ins(Instruction::LocalGet(scratch));
        } else {
            let got = self.emit_value(f, rhs, scan, row)?;
            widen(f, got, common);
        }

        use BinOp::*;
        let ins = match (common, op) {
            (Emitted::I32, Add) => Instruction::I32Add,
            (Emitted::I32, Sub) => Instruction::I32Sub,
            (Emitted::I32, Mul) => Instruction::I32Mul,
            (Emitted::I32, Div) => Instruction::I32DivS,
            (Emitted::I32, Eq) => Instruction::I32Eq,
            (Emitted::I32, Ne) => Instruction::I32Ne,
            (Emitted::I32, Lt) => Instruction::I32LtS,
            (Emitted::I32, Le) => Instruction::I32LeS,
            (Emitted::I32, Gt) => Instruction::I32GtS,
            (Emitted::I32, Ge) => Instruction::I32GeS,
            (Emitted::I64, Add) => Instruction::I64Add,
            (Emitted::I64, Sub) => Instruction::I64Sub,
            (Emitted::I64, Mul) => Instruction::I64Mul,
            (Emitted::I64, Div) => Instruction::I64DivS,
            (Emitted::I64, Eq) => Instruction::I64Eq,
            (Emitted::I64, Ne) => Instruction::I64Ne,
            (Emitted::I64, Lt) => Instruction::I64LtS,
            (Emitted::I64, Le) => Instruction::I64LeS,
            (Emitted::I64, Gt) => Instruction::I64GtS,
            (Emitted::I64, Ge) => Instruction::I64GeS,
            (Emitted::F32, Add) => Instruction::F32Add,
            (Emitted::F32, Sub) => Instruction::F32Sub,
            (Emitted::F32, Mul) => Instruction::F32Mul,
            (Emitted::F32, Div) => Instruction::F32Div,
            (Emitted::F32, Eq) => Instruction::F32Eq,
            (Emitted::F32, Ne) => Instruction::F32Ne,
            (Emitted::F32, Lt) => Instruction::F32Lt,
            (Emitted::F32, Le) => Instruction::F32Le,
            (Emitted::F32, Gt) => Instruction::F32Gt,
            (Emitted::F32, Ge) => Instruction::F32Ge,
            (Emitted::F64, Add) => Instruction::F64Add,
            (Emitted::F64, Sub) => Instruction::F64Sub,
            (Emitted::F64, Mul) => Instruction::F64Mul,
            (Emitted::F64, Div) => Instruction::F64Div,
            (Emitted::F64, Eq) => Instruction::F64Eq,
            (Emitted::F64, Ne) => Instruction::F64Ne,
            (Emitted::F64, Lt) => Instruction::F64Lt,
            (Emitted::F64, Le) => Instruction::F64Le,
            (Emitted::F64, Gt) => Instruction::F64Gt,
            (Emitted::F64, Ge) => Instruction::F64Ge,
            (Emitted::Ptr { .. }, _) => unreachable!("handled above"),
        };
        f.ins(ins);
        Ok(if op.is_comparison() {
            Emitted::I32
        } else {
            common
        })
    }

    /// Stores one payload column of the current row.
    #[allow(clippy::too_many_arguments)]
    fn emit_payload_store(
        &mut self,
        f: &mut FnBuilder,
        j: usize,
        ty: Type,
        expr: &Expr,
        scan: &ScanBinding<'_>,
        layout: &DataLayout,
        row: u32,
        out_addr: u32,
    ) -> Result<(), CodegenError> {
        let slot = layout.slots[j].offset as u64;
        match ty {
            Type::Char(_) => {
                let copy_len = self.emit_char_store_prologue(f, expr, scan, row, out_addr, slot)?;
                f.ins(Instruction::I32Const(copy_len as i32))
                    .ins(Instruction::MemoryCopy {
                        src_mem: 0,
                        dst_mem: 0,
                    });
            }
            _ => {
                f.ins(Instruction::LocalGet(out_addr));
                let emitted = self.emit_value(f, expr, scan, row)?;
                let store = match (emitted, ty) {
                    (Emitted::I32, Type::Bool | Type::I8) => Instruction::I32Store8(memarg(slot)),
                    (Emitted::I32, Type::I16) => Instruction::I32Store16(memarg(slot)),
                    (Emitted::I32, _) => Instruction::I32Store(memarg(slot)),
                    (Emitted::I64, _) => Instruction::I64Store(memarg(slot)),
                    (Emitted::F32, _) => Instruction::F32Store(memarg(slot)),
                    (Emitted::F64, _) => Instruction::F64Store(memarg(slot)),
                    (Emitted::Ptr { .. }, _) => unreachable!("characters handled above"),
                };
                f.ins(store);
            }
        }

        // Designators can be NULL; propagate the bit from the source row.
        if let Expr::Column { id, .. } = expr {
            let (col, _) = scan
                .schema
                .find(id)
                .ok_or_else(|| CodegenError::UnresolvedColumn(id.clone()))?;
            let src_byte = (scan.layout.null_bitmap_offset + col / 8) as u64;
            let dst_byte = (layout.null_bitmap_offset + j / 8) as u64;
            f.ins(Instruction::LocalGet(row))
                .ins(Instruction::I32Load8U(memarg(src_byte)))
                .ins(Instruction::I32Const(1 << (col % 8)))
                .ins(Instruction::I32And)
                .ins(Instruction::If(BlockType::Empty))
                .ins(Instruction::LocalGet(out_addr))
                .ins(Instruction::LocalGet(out_addr))
                .ins(Instruction::I32Load8U(memarg(dst_byte)))
                .ins(Instruction::I32Const(1 << (j % 8)))
                .ins(Instruction::I32Or)
                .ins(Instruction::I32Store8(memarg(dst_byte)))
                .ins(Instruction::End);
        }
        Ok(())
    }

    /// Pushes destination and source addresses of a character copy; returns
    /// the byte count to copy.
    fn emit_char_store_prologue(
        &mut self,
        f: &mut FnBuilder,
        expr: &Expr,
        scan: &ScanBinding<'_>,
        row: u32,
        out_addr: u32,
        slot: u64,
    ) -> Result<u32, CodegenError> {
        f.ins(Instruction::LocalGet(out_addr))
            .ins(Instruction::I32Const(slot as i32))
            .ins(Instruction::I32Add);
        match self.emit_value(f, expr, scan, row)? {
            Emitted::Ptr { copy_len } => Ok(copy_len),
            other => Err(CodegenError::UnsupportedExpression(format!(
                "character column fed by a {other:?} expression"
            ))),
        }
    }

    fn emit_key(
        &mut self,
        f: &mut FnBuilder,
        key_type: KeyType,
        key: &Value,
    ) -> Result<(), CodegenError> {
        match (key_type, key) {
            (KeyType::Bool, Value::Bool(b)) => {
                f.ins(Instruction::I32Const(*b as i32));
            }
            (KeyType::I8 | KeyType::I16 | KeyType::I32, Value::Int(v)) => {
                f.ins(Instruction::I32Const(*v as i32));
            }
            (KeyType::I32, Value::Date(d)) => {
                f.ins(Instruction::I32Const(*d));
            }
            (KeyType::I64, Value::Int(v)) => {
                f.ins(Instruction::I64Const(*v));
            }
            (KeyType::I64, Value::DateTime(t)) => {
                f.ins(Instruction::I64Const(*t));
            }
            (KeyType::F32, Value::Float(v)) => {
                f.ins(Instruction::F32Const(*v as f32));
            }
            (KeyType::F64, Value::Float(v)) => {
                f.ins(Instruction::F64Const(*v));
            }
            (KeyType::Str, Value::Str(s)) => {
                let off = self
                    .builder
                    .literal_offset(s)
                    .ok_or_else(|| CodegenError::UnmappedLiteral(s.clone()))?;
                f.ins(Instruction::I32Const(off as i32));
            }
            _ => {
                return Err(CodegenError::UnsupportedExpression(format!(
                    "{key_type} index probed with key {key:?}"
                )))
            }
        }
        Ok(())
    }

    /// Scans the resolved bottom filters for an equality predicate an index
    /// over the scanned table can answer.
    fn find_index_probe(
        &self,
        scan: &ScanBinding<'_>,
        filters: &[Vec<Vec<Expr>>],
    ) -> Result<Option<IndexProbe>, CodegenError> {
        for (fi, clauses) in filters.iter().enumerate() {
            for (ci, clause) in clauses.iter().enumerate() {
                let [pred] = clause.as_slice() else { continue };
                let Expr::Binary { op: BinOp::Eq, lhs, rhs, .. } = pred else {
                    continue;
                };
                let (column, konst) = match (lhs.as_ref(), rhs.as_ref()) {
                    (Expr::Column { id, .. }, c) if c.is_constant() => (id, c),
                    (c, Expr::Column { id, .. }) if c.is_constant() => (id, c),
                    _ => continue,
                };
                let Some((col, _)) = scan.schema.find(column) else {
                    continue;
                };
                let store_col = match self.env.table(&scan.table_name) {
                    Some(binding) => binding.store.table().columns[col].name.clone(),
                    None => continue,
                };
                let Some((index_id, handle)) =
                    self.ctx.find_index(&scan.table_name, &store_col)
                else {
                    continue;
                };
                let Expr::Constant { value: Some(key), .. } = konst else {
                    continue;
                };
                if !key_matches(handle.key_type(), key) {
                    continue;
                }
                return Ok(Some(IndexProbe {
                    index_id,
                    kind: handle.kind(),
                    key_type: handle.key_type(),
                    key: key.clone(),
                    consumed: (fi, ci),
                }));
            }
        }
        Ok(None)
    }
}

enum LoopBound {
    Local(u32),
    Global(u32),
}

fn key_matches(kt: KeyType, key: &Value) -> bool {
    matches!(
        (kt, key),
        (KeyType::Bool, Value::Bool(_))
            | (KeyType::I8 | KeyType::I16 | KeyType::I32 | KeyType::I64, Value::Int(_))
            | (KeyType::I32, Value::Date(_))
            | (KeyType::I64, Value::DateTime(_))
            | (KeyType::F32 | KeyType::F64, Value::Float(_))
            | (KeyType::Str, Value::Str(_))
    )
}

fn valtype_of(e: Emitted) -> ValType {
    match e {
        Emitted::I32 | Emitted::Ptr { .. } => ValType::I32,
        Emitted::I64 => ValType::I64,
        Emitted::F32 => ValType::F32,
        Emitted::F64 => ValType::F64,
    }
}

/// The common width two operands are brought to, or `None` when they cannot
/// be combined.
fn common_width(l: Emitted, r: Emitted) -> Option<Emitted> {
    match (l, r) {
        (Emitted::Ptr { copy_len: a }, Emitted::Ptr { copy_len: b }) => Some(Emitted::Ptr {
            copy_len: a.max(b),
        }),
        (Emitted::I32, Emitted::I32) => Some(Emitted::I32),
        (Emitted::I32 | Emitted::I64, Emitted::I32 | Emitted::I64) => Some(Emitted::I64),
        (Emitted::F32, Emitted::F32) => Some(Emitted::F32),
        (Emitted::F64, Emitted::F64) => Some(Emitted::F64),
        _ => None,
    }
}

fn widen(f: &mut FnBuilder, got: Emitted, want: Emitted) {
    if got == Emitted::I32 && want == Emitted::I64 {
        f.ins(Instruction::I64ExtendI32S);
    }
}

fn expr_compares_strings(expr: &Expr) -> bool {
    match expr {
        Expr::Binary { op, lhs, rhs, .. } => {
            (op.is_comparison() && lhs.ty().is_character() && rhs.ty().is_character())
                || expr_compares_strings(lhs)
                || expr_compares_strings(rhs)
        }
        Expr::Unary { expr, .. } => expr_compares_strings(expr),
        _ => false,
    }
}

fn collect_columns(
    expr: &Expr,
    scan: &ScanBinding<'_>,
    out: &mut Vec<usize>,
) -> Result<(), CodegenError> {
    match expr {
        Expr::Column { id, .. } => {
            let (col, _) = scan
                .schema
                .find(id)
                .ok_or_else(|| CodegenError::UnresolvedColumn(id.clone()))?;
            out.push(col);
        }
        Expr::Constant { .. } => {}
        Expr::Unary { expr, .. } => collect_columns(expr, scan, out)?,
        Expr::Binary { lhs, rhs, .. } => {
            collect_columns(lhs, scan, out)?;
            collect_columns(rhs, scan, out)?;
        }
    }
    Ok(())
}

/// Rewrites a predicate above the projection in terms of the scan's columns
/// by substituting projected expressions for their output identifiers.
fn substitute(expr: &Expr, proj: Option<&ProjectionOp>) -> Result<Expr, CodegenError> {
    let Some(proj) = proj else {
        return Ok(expr.clone());
    };
    Ok(match expr {
        Expr::Column { id, .. } => match proj.schema.find(id) {
            Some((idx, _)) => proj.projections[idx].0.clone(),
            None => expr.clone(),
        },
        Expr::Constant { .. } => expr.clone(),
        Expr::Unary { op, expr, ty } => Expr::Unary {
            op: *op,
            expr: Box::new(substitute(expr, Some(proj))?),
            ty: *ty,
        },
        Expr::Binary { op, lhs, rhs, ty } => Expr::Binary {
            op: *op,
            lhs: Box::new(substitute(lhs, Some(proj))?),
            rhs: Box::new(substitute(rhs, Some(proj))?),
            ty: *ty,
        },
    })
}

/// The scan-rooted expression producing one payload column.
fn payload_source(id: &str, ty: Type, proj: Option<&ProjectionOp>) -> Expr {
    if let Some(proj) = proj {
        if let Some((idx, _)) = proj.schema.find(id) {
            return proj.projections[idx].0.clone();
        }
    }
    Expr::Column {
        id: id.to_owned(),
        ty,
    }
}

/// `streq(a, b)`: bytewise comparison of two NUL-terminated strings.
fn emit_streq() -> Function {
    let mut f = FnBuilder::new(2);
    let ca = f.local(ValType::I32);
    f.ins(Instruction::Block(BlockType::Empty)); // 0: not equal
    f.ins(Instruction::Block(BlockType::Empty)); // 1: equal
    f.ins(Instruction::Loop(BlockType::Empty)); // 2
    f.ins(Instruction::LocalGet(0))
        .ins(Instruction::I32Load8U(memarg(0)))
        .ins(Instruction::LocalTee(ca))
        .ins(Instruction::LocalGet(1))
        .ins(Instruction::I32Load8U(memarg(0)))
        .ins(Instruction::I32Ne)
        .br_if_to(0);
    f.ins(Instruction::LocalGet(ca))
        .ins(Instruction::I32Eqz)
        .br_if_to(1);
    f.ins(Instruction::LocalGet(0))
        .ins(Instruction::I32Const(1))
        .ins(Instruction::I32Add)
        .ins(Instruction::LocalSet(0))
        .ins(Instruction::LocalGet(1))
        .ins(Instruction::I32Const(1))
        .ins(Instruction::I32Add)
        .ins(Instruction::LocalSet(1));
    f.br_to(2);
    f.ins(Instruction::End); // loop
    f.ins(Instruction::End); // equal
    f.ins(Instruction::I32Const(1)).ins(Instruction::Return);
    f.ins(Instruction::End); // not equal
    f.ins(Instruction::I32Const(0));
    f.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quern_lib::expr::Clause;
    use quern_lib::plan::{PhysicalPlan, PrintSink};
    use quern_lib::store::{Column, Table};
    use std::sync::Mutex;

    fn sink() -> PrintSink {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn scan_op() -> Operator {
        let table = Arc::new(Table::new(
            "t",
            vec![Column::new("id", Type::I32), Column::new("name", Type::Char(8))],
        ));
        let mut store = RowStore::new(table);
        store
            .append(&[Some(Value::Int(1)), Some(Value::Str("a".into()))])
            .unwrap();
        Operator::scan(Arc::new(store), "t")
    }

    #[test]
    fn analyze_accepts_the_lowered_shape() {
        let plan = scan_op()
            .filter(Cnf::single(Expr::cmp(
                BinOp::Gt,
                Expr::column("t.id", Type::I32),
                Expr::int(0),
            )))
            .project(vec![(Expr::column("t.id", Type::I32), None)])
            .limit(10, 2)
            .print(sink());
        let shape = analyze(&plan).unwrap();
        assert!(shape.scan.is_some());
        assert!(shape.projection.is_some());
        assert_eq!(shape.limit, Some((10, 2)));
        assert_eq!(shape.filters.len(), 1);
        assert!(shape.filters[0].1, "filter sits below the projection");
    }

    #[test]
    fn analyze_rejects_joins() {
        let plan = Operator::Join(quern_lib::plan::JoinOp {
            predicate: Cnf::default(),
            children: vec![scan_op(), scan_op()],
            schema: Schema::default(),
        })
        .print(sink());
        assert!(matches!(
            analyze(&plan),
            Err(CodegenError::UnsupportedPipeline("Join"))
        ));
    }

    #[test]
    fn analyze_rejects_non_sink_roots() {
        let plan = scan_op();
        assert!(matches!(
            analyze(&plan),
            Err(CodegenError::RootNotSink("Scan"))
        ));
    }

    #[test]
    fn literal_collection_walks_filters_and_projections() {
        let plan = scan_op()
            .filter(Cnf(vec![Clause(vec![Expr::cmp(
                BinOp::Eq,
                Expr::column("t.name", Type::Char(8)),
                Expr::str("alice"),
            )])]))
            .project(vec![
                (Expr::column("t.id", Type::I32), None),
                (Expr::str("tag"), None),
            ])
            .print(sink());
        assert_eq!(collect_string_literals(&plan), ["alice", "tag"]);
    }

    #[test]
    fn table_collection_deduplicates() {
        let scan = scan_op();
        let table = match &scan {
            Operator::Scan(s) => s.store.clone(),
            _ => unreachable!(),
        };
        let plan = Operator::Scan(quern_lib::plan::ScanOp {
            store: table.clone(),
            alias: "t2".into(),
            schema: scan.schema().clone(),
        })
        .print(sink());
        let tables = collect_tables(&plan);
        assert_eq!(tables.len(), 1);
        let both = PhysicalPlan::new(scan.print(sink()));
        assert_eq!(collect_tables(both.matched_root()).len(), 1);
    }

    #[test]
    fn streq_body_balances_blocks() {
        // Sanity: the emitted helper must close every block it opens.
        let f = emit_streq();
        let _ = f; // construction would have panicked on imbalance
    }
}
