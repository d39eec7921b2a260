//! The Wasm module builder.
//!
//! Accumulates everything code generation produces for one query (typed
//! function imports, global imports, function bodies, exports, the string
//! literal table, the message table and allocator pre-allocations) and
//! emits the validated binary. Section-by-section emission follows the
//! usual `wasm-encoder` shape; the binary is validated before it is handed
//! to the engine, and a validation failure is a code-generator bug.

use crate::context::{ContextId, Message};
use std::collections::HashMap;
use std::panic::Location;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use wasm_encoder::{
    CodeSection, ConstExpr, EntityType, ExportKind, ExportSection, Function, FunctionSection,
    GlobalSection, GlobalType, ImportSection, MemorySection, MemoryType, Module, TypeSection,
    ValType,
};

/// Module of every host import in the generated code.
pub const IMPORT_MODULE: &str = "env";

static NEXT_MODULE_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        FuncType {
            params: params.to_vec(),
            results: results.to_vec(),
        }
    }
}

/// Initializer of a defined global.
#[derive(Debug, Clone, Copy)]
pub enum GlobalInit {
    I32(i32),
    I64(i64),
}

struct DefinedFunc {
    ty: FuncType,
    body: Option<Function>,
    export: Option<String>,
}

struct DefinedGlobal {
    mutable: bool,
    init: GlobalInit,
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("generated module failed validation: {error}")]
    Invalid { error: String, wat: String },
    #[error("function index {0} was reserved but never given a body")]
    MissingBody(u32),
}

/// Accumulates one query's module and emits the binary.
pub struct ModuleBuilder {
    id: ContextId,
    memory_pages: u64,
    func_imports: Vec<(String, FuncType)>,
    func_import_ids: HashMap<String, u32>,
    global_imports: Vec<(String, ValType)>,
    global_import_ids: HashMap<String, u32>,
    defined_funcs: Vec<DefinedFunc>,
    defined_globals: Vec<DefinedGlobal>,
    imports_frozen: bool,
    literals: Vec<String>,
    literal_offsets: HashMap<String, u32>,
    messages: Vec<Message>,
    preallocated: u32,
}

impl ModuleBuilder {
    /// A fresh builder for a linear memory of `memory_pages` Wasm pages.
    /// Assigns the module id that doubles as the query's context id.
    pub fn new(memory_pages: u64) -> Self {
        ModuleBuilder {
            id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            memory_pages,
            func_imports: Vec::new(),
            func_import_ids: HashMap::new(),
            global_imports: Vec::new(),
            global_import_ids: HashMap::new(),
            defined_funcs: Vec::new(),
            defined_globals: Vec::new(),
            imports_frozen: false,
            literals: Vec::new(),
            literal_offsets: HashMap::new(),
            messages: Vec::new(),
            preallocated: 0,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Imports a typed function; repeated imports of the same name return
    /// the original index.
    pub fn import_func(&mut self, name: &str, params: &[ValType], results: &[ValType]) -> u32 {
        if let Some(&idx) = self.func_import_ids.get(name) {
            return idx;
        }
        assert!(
            !self.imports_frozen,
            "function import `{name}` after the index space was frozen"
        );
        let idx = self.func_imports.len() as u32;
        self.func_imports
            .push((name.to_owned(), FuncType::new(params, results)));
        self.func_import_ids.insert(name.to_owned(), idx);
        idx
    }

    /// Imports an immutable global; repeated imports return the original
    /// index.
    pub fn import_global(&mut self, name: &str, ty: ValType) -> u32 {
        if let Some(&idx) = self.global_import_ids.get(name) {
            return idx;
        }
        assert!(
            !self.imports_frozen,
            "global import `{name}` after the index space was frozen"
        );
        let idx = self.global_imports.len() as u32;
        self.global_imports.push((name.to_owned(), ty));
        self.global_import_ids.insert(name.to_owned(), idx);
        idx
    }

    /// Reserves a defined function's index, freezing the import spaces. The
    /// body is supplied later via [`ModuleBuilder::set_body`].
    pub fn reserve_func(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        self.imports_frozen = true;
        let idx = self.func_imports.len() + self.defined_funcs.len();
        self.defined_funcs.push(DefinedFunc {
            ty: FuncType::new(params, results),
            body: None,
            export: None,
        });
        idx as u32
    }

    pub fn set_body(&mut self, func: u32, body: Function) {
        let local = func as usize - self.func_imports.len();
        self.defined_funcs[local].body = Some(body);
    }

    pub fn export_func(&mut self, func: u32, name: &str) {
        let local = func as usize - self.func_imports.len();
        self.defined_funcs[local].export = Some(name.to_owned());
    }

    /// Defines a module-local global, freezing the import spaces.
    pub fn define_global(&mut self, mutable: bool, init: GlobalInit) -> u32 {
        self.imports_frozen = true;
        let idx = self.global_imports.len() + self.defined_globals.len();
        self.defined_globals.push(DefinedGlobal { mutable, init });
        idx as u32
    }

    /// Records a string literal, deduplicated, preserving first-seen order.
    pub fn add_literal(&mut self, literal: &str) {
        if !self.literal_offsets.contains_key(literal) {
            self.literal_offsets.insert(literal.to_owned(), u32::MAX);
            self.literals.push(literal.to_owned());
        }
    }

    pub fn literals(&self) -> &[String] {
        &self.literals
    }

    /// Records where a literal was mapped in the arena.
    pub fn set_literal_offset(&mut self, literal: &str, offset: u32) {
        if let Some(slot) = self.literal_offsets.get_mut(literal) {
            *slot = offset;
        }
    }

    pub fn literal_offset(&self, literal: &str) -> Option<u32> {
        self.literal_offsets
            .get(literal)
            .copied()
            .filter(|&off| off != u32::MAX)
    }

    /// Adds a message to the message table, attributing it to the caller's
    /// source location, and returns its id.
    #[track_caller]
    pub fn add_message(&mut self, msg: impl Into<String>) -> u64 {
        let loc = Location::caller();
        self.messages.push(Message {
            file: loc.file().to_owned(),
            line: loc.line(),
            msg: msg.into(),
        });
        (self.messages.len() - 1) as u64
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    /// Accounts a pre-allocated guest memory region (result buffers and the
    /// like) for the allocator statistics.
    pub fn track_preallocation(&mut self, bytes: u32) {
        self.preallocated = self.preallocated.saturating_add(bytes);
    }

    pub fn preallocated_bytes(&self) -> u32 {
        self.preallocated
    }

    /// Emits the binary and validates it.
    pub fn finish(&self) -> Result<Vec<u8>, ModuleError> {
        let mut type_ids: HashMap<FuncType, u32> = HashMap::new();
        let mut types = TypeSection::new();
        let mut type_of = |ty: &FuncType, types: &mut TypeSection| -> u32 {
            if let Some(&idx) = type_ids.get(ty) {
                return idx;
            }
            let idx = type_ids.len() as u32;
            types.function(ty.params.iter().copied(), ty.results.iter().copied());
            type_ids.insert(ty.clone(), idx);
            idx
        };

        let mut imports = ImportSection::new();
        for (name, ty) in &self.func_imports {
            let tid = type_of(ty, &mut types);
            imports.import(IMPORT_MODULE, name, EntityType::Function(tid));
        }
        for (name, ty) in &self.global_imports {
            imports.import(
                IMPORT_MODULE,
                name,
                EntityType::Global(GlobalType {
                    val_type: *ty,
                    mutable: false,
                    shared: false,
                }),
            );
        }

        let mut functions = FunctionSection::new();
        for f in &self.defined_funcs {
            functions.function(type_of(&f.ty, &mut types));
        }

        let mut memories = MemorySection::new();
        memories.memory(MemoryType {
            minimum: self.memory_pages,
            maximum: Some(self.memory_pages),
            memory64: false,
            shared: false,
            page_size_log2: None,
        });

        let mut globals = GlobalSection::new();
        for g in &self.defined_globals {
            let (val_type, init) = match g.init {
                GlobalInit::I32(v) => (ValType::I32, ConstExpr::i32_const(v)),
                GlobalInit::I64(v) => (ValType::I64, ConstExpr::i64_const(v)),
            };
            globals.global(
                GlobalType {
                    val_type,
                    mutable: g.mutable,
                    shared: false,
                },
                &init,
            );
        }

        let mut exports = ExportSection::new();
        exports.export("memory", ExportKind::Memory, 0);
        for (i, f) in self.defined_funcs.iter().enumerate() {
            if let Some(name) = &f.export {
                exports.export(name, ExportKind::Func, (self.func_imports.len() + i) as u32);
            }
        }

        let mut code = CodeSection::new();
        for (i, f) in self.defined_funcs.iter().enumerate() {
            let body = f
                .body
                .as_ref()
                .ok_or(ModuleError::MissingBody((self.func_imports.len() + i) as u32))?;
            code.function(body);
        }

        let mut module = Module::new();
        module
            .section(&types)
            .section(&imports)
            .section(&functions)
            .section(&memories)
            .section(&globals)
            .section(&exports)
            .section(&code);
        let bytes = module.finish();

        if let Err(e) = wasmparser::Validator::new().validate_all(&bytes) {
            return Err(ModuleError::Invalid {
                error: e.to_string(),
                wat: render_wat(&bytes),
            });
        }
        Ok(bytes)
    }
}

/// The module as WAT, or a placeholder when even printing fails.
pub fn render_wat(bytes: &[u8]) -> String {
    wasmprinter::print_bytes(bytes)
        .unwrap_or_else(|e| format!("<unprintable module: {e}; {} bytes>", bytes.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasm_encoder::Instruction;

    #[test]
    fn minimal_module_validates() {
        let mut b = ModuleBuilder::new(1);
        let print = b.import_func("print", &[ValType::I32], &[]);
        let counter = b.define_global(true, GlobalInit::I32(0));
        let main = b.reserve_func(&[ValType::I32], &[ValType::I32]);
        b.export_func(main, "main");
        let mut body = Function::new([]);
        body.instruction(&Instruction::I32Const(7))
            .instruction(&Instruction::Call(print))
            .instruction(&Instruction::GlobalGet(counter))
            .instruction(&Instruction::End);
        b.set_body(main, body);
        let bytes = b.finish().unwrap();
        assert_eq!(&bytes[..4], b"\0asm");
    }

    #[test]
    fn imports_deduplicate_by_name() {
        let mut b = ModuleBuilder::new(1);
        let a = b.import_func("print", &[ValType::I32], &[]);
        let c = b.import_func("print", &[ValType::I32], &[]);
        assert_eq!(a, c);
        let g = b.import_global("t_mem", ValType::I32);
        assert_eq!(b.import_global("t_mem", ValType::I32), g);
    }

    #[test]
    fn missing_body_is_a_builder_error() {
        let mut b = ModuleBuilder::new(1);
        let f = b.reserve_func(&[], &[]);
        assert!(matches!(b.finish(), Err(ModuleError::MissingBody(i)) if i == f));
    }

    #[test]
    fn literals_keep_first_seen_order() {
        let mut b = ModuleBuilder::new(1);
        b.add_literal("b");
        b.add_literal("a");
        b.add_literal("b");
        assert_eq!(b.literals(), ["b".to_string(), "a".to_string()]);
        b.set_literal_offset("a", 4096);
        assert_eq!(b.literal_offset("a"), Some(4096));
        assert_eq!(b.literal_offset("b"), None);
    }

    #[test]
    fn message_table_records_caller() {
        let mut b = ModuleBuilder::new(1);
        let id = b.add_message("result buffer overflow");
        let msgs = b.take_messages();
        assert_eq!(id, 0);
        assert!(msgs[0].file.ends_with("module.rs"));
        assert!(msgs[0].line > 0);
    }
}
