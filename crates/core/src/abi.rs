//! The host ABI: every function the guest imports.
//!
//! `print`, `insist`, `throw`, `print_memory_consumption` and
//! `read_result_set` are singletons; the index family is one function per
//! `(kind × key type × operation)`, generated from a dispatch table rather
//! than looked up by runtime type. The guest addresses indexes by integer id
//! and passes string keys as arena offsets, NUL-terminated.
//!
//! Every callback recovers its per-query state through the context registry
//! using nothing but the context id carried in the store data.

use crate::context::{self, ContextId, Message, WasmContext};
use crate::error::{ExceptionKind, GuestException};
use crate::module::ModuleBuilder;
use anyhow::Context as _;
use quern_lib::index::{IndexKind, KeyType, KeyValue, SeekBound};
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use wasm_encoder::ValType;
use wasmtime::{Caller, Linker};

/// Store data of one instantiated module: the way back from a host callback
/// to the query's context.
pub struct WasmInstanceEnv {
    ctx_id: ContextId,
}

impl WasmInstanceEnv {
    pub fn new(ctx_id: ContextId) -> Self {
        WasmInstanceEnv { ctx_id }
    }

    pub fn ctx_id(&self) -> ContextId {
        self.ctx_id
    }
}

/// One entry per `(kind, key type)` of the index ABI.
fn kind_key_types(kind: IndexKind) -> &'static [KeyType] {
    match kind {
        IndexKind::Array => &[
            KeyType::Bool,
            KeyType::I8,
            KeyType::I16,
            KeyType::I32,
            KeyType::I64,
            KeyType::F32,
            KeyType::F64,
            KeyType::Str,
        ],
        // The learned index has no bool or string instantiation.
        IndexKind::RecursiveModel => &[
            KeyType::I8,
            KeyType::I16,
            KeyType::I32,
            KeyType::I64,
            KeyType::F32,
            KeyType::F64,
        ],
    }
}

fn kind_name(kind: IndexKind) -> &'static str {
    match kind {
        IndexKind::Array => "array",
        IndexKind::RecursiveModel => "rmi",
    }
}

/// `b`, `i1`..`i8` by byte width, `f`/`d` for the float widths, `p` for
/// string keys.
fn key_suffix(kt: KeyType) -> &'static str {
    match kt {
        KeyType::Bool => "b",
        KeyType::I8 => "i1",
        KeyType::I16 => "i2",
        KeyType::I32 => "i4",
        KeyType::I64 => "i8",
        KeyType::F32 => "f",
        KeyType::F64 => "d",
        KeyType::Str => "p",
    }
}

fn key_valtype(kt: KeyType) -> ValType {
    match kt {
        KeyType::Bool | KeyType::I8 | KeyType::I16 | KeyType::I32 | KeyType::Str => ValType::I32,
        KeyType::I64 => ValType::I64,
        KeyType::F32 => ValType::F32,
        KeyType::F64 => ValType::F64,
    }
}

/// Function-import indices of the ABI within one generated module.
pub struct AbiImports {
    pub print: u32,
    pub print_memory_consumption: u32,
    pub insist: u32,
    pub throw: u32,
    pub read_result_set: u32,
    seek_ids: HashMap<(IndexKind, KeyType, SeekBound), u32>,
    scan_ids: HashMap<(IndexKind, KeyType), u32>,
}

impl AbiImports {
    /// Registers the full ABI on the module builder, index family included,
    /// mirroring what the linker provides at instantiation.
    pub fn register(b: &mut ModuleBuilder) -> AbiImports {
        let print = b.import_func("print", &[ValType::I32], &[]);
        let print_memory_consumption =
            b.import_func("print_memory_consumption", &[ValType::I32, ValType::I32], &[]);
        let insist = b.import_func("insist", &[ValType::I64], &[]);
        let throw = b.import_func("throw", &[ValType::I64, ValType::I64], &[]);
        let read_result_set =
            b.import_func("read_result_set", &[ValType::I32, ValType::I32], &[]);

        let mut seek_ids = HashMap::new();
        let mut scan_ids = HashMap::new();
        for kind in [IndexKind::Array, IndexKind::RecursiveModel] {
            let kname = kind_name(kind);
            for &kt in kind_key_types(kind) {
                let sfx = key_suffix(kt);
                let seek_sig = [ValType::I64, key_valtype(kt)];
                let lower = b.import_func(
                    &format!("idx_lower_bound_{kname}_{sfx}"),
                    &seek_sig,
                    &[ValType::I32],
                );
                let upper = b.import_func(
                    &format!("idx_upper_bound_{kname}_{sfx}"),
                    &seek_sig,
                    &[ValType::I32],
                );
                let scan = b.import_func(
                    &format!("idx_scan_{kname}_{sfx}"),
                    &[ValType::I64, ValType::I32, ValType::I32, ValType::I32],
                    &[],
                );
                seek_ids.insert((kind, kt, SeekBound::Lower), lower);
                seek_ids.insert((kind, kt, SeekBound::Upper), upper);
                scan_ids.insert((kind, kt), scan);
            }
        }
        AbiImports {
            print,
            print_memory_consumption,
            insist,
            throw,
            read_result_set,
            seek_ids,
            scan_ids,
        }
    }

    pub fn seek(&self, kind: IndexKind, kt: KeyType, bound: SeekBound) -> u32 {
        *self
            .seek_ids
            .get(&(kind, kt, bound))
            .unwrap_or_else(|| unreachable!("no {bound:?} import for {kind:?}/{kt}"))
    }

    pub fn scan(&self, kind: IndexKind, kt: KeyType) -> u32 {
        *self
            .scan_ids
            .get(&(kind, kt))
            .unwrap_or_else(|| unreachable!("no scan import for {kind:?}/{kt}"))
    }
}

/// A key argument as it arrives over the Wasm boundary, before the context
/// is available to decode string offsets.
enum RawKey {
    Bool(u32),
    I8(i32),
    I16(i32),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(u32),
}

fn decode_key(ctx: &WasmContext, raw: RawKey) -> anyhow::Result<KeyValue> {
    Ok(match raw {
        RawKey::Bool(v) => KeyValue::Bool(v != 0),
        RawKey::I8(v) => KeyValue::I8(v as i8),
        RawKey::I16(v) => KeyValue::I16(v as i16),
        RawKey::I32(v) => KeyValue::I32(v),
        RawKey::I64(v) => KeyValue::I64(v),
        RawKey::F32(v) => KeyValue::F32(v),
        RawKey::F64(v) => KeyValue::F64(v),
        RawKey::Str(offset) => {
            let bytes = unsafe { ctx.arena().c_str(offset, usize::MAX) }
                .context("reading a string index key from guest memory")?;
            KeyValue::Str(bytes.into())
        }
    })
}

fn unknown_message() -> Message {
    Message {
        file: "<unknown>".into(),
        line: 0,
        msg: String::new(),
    }
}

impl WasmInstanceEnv {
    fn ctx(caller: &Caller<'_, Self>) -> anyhow::Result<Arc<WasmContext>> {
        Ok(context::get(caller.data().ctx_id)?)
    }

    /// Tracing aid for generated code; prints each argument the guest
    /// hands over.
    pub fn print(_caller: Caller<'_, Self>, value: u32) {
        if cfg!(debug_assertions) {
            print!("wasm function callback: ");
        }
        println!("{value:#x}");
    }

    /// Reports the guest allocator's counters in MiB.
    pub fn print_memory_consumption(_caller: Caller<'_, Self>, total: u32, peak: u32) {
        println!(
            "Allocated memory overall consumption: {} MiB",
            total as f64 / (1024.0 * 1024.0)
        );
        println!(
            "Allocated memory peak consumption: {} MiB",
            peak as f64 / (1024.0 * 1024.0)
        );
    }

    /// A failed assertion in generated code. Prints the recorded provenance
    /// and aborts the process.
    pub fn insist(caller: Caller<'_, Self>, msg_id: u64) {
        let message = Self::ctx(&caller)
            .ok()
            .and_then(|ctx| ctx.message(msg_id).cloned())
            .unwrap_or_else(unknown_message);
        let _ = std::io::stdout().flush();
        eprint!(
            "{}:{}: assertion in generated code failed.",
            message.file, message.line
        );
        if !message.msg.is_empty() {
            eprint!("  {}.", message.msg);
        }
        eprintln!();
        std::process::abort();
    }

    /// A typed exception raised by generated code; unwinds the engine back
    /// to the driver.
    pub fn throw(caller: Caller<'_, Self>, kind: u64, msg_id: u64) -> anyhow::Result<()> {
        let ctx = Self::ctx(&caller)?;
        let message = ctx.message(msg_id).cloned().unwrap_or_else(unknown_message);
        let kind = ExceptionKind::from_u64(kind)
            .ok_or_else(|| anyhow::anyhow!("guest threw unknown exception kind {kind}"))?;
        Err(GuestException {
            kind,
            file: message.file,
            line: message.line,
            msg: message.msg,
        }
        .into())
    }

    /// The guest finished writing its result buffer; decode and emit it.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn read_result_set(caller: Caller<'_, Self>, offset: u32, count: u32) -> anyhow::Result<()> {
        let ctx = Self::ctx(&caller)?;
        crate::result::read_result_set(&ctx, offset, count)?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    fn index_seek(
        caller: Caller<'_, Self>,
        index_id: u64,
        kind: IndexKind,
        bound: SeekBound,
        raw: RawKey,
    ) -> anyhow::Result<u32> {
        let ctx = Self::ctx(&caller)?;
        let handle = ctx.index(index_id)?;
        anyhow::ensure!(
            handle.kind() == kind,
            "index {index_id} is a {:?} index but was probed as {kind:?}",
            handle.kind()
        );
        let key = decode_key(&ctx, raw)?;
        Ok(handle.seek(&key, bound)?)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    fn index_scan(
        caller: Caller<'_, Self>,
        index_id: u64,
        kind: IndexKind,
        key_type: KeyType,
        entry: u32,
        out_addr: u32,
        batch: u32,
    ) -> anyhow::Result<()> {
        let ctx = Self::ctx(&caller)?;
        let handle = ctx.index(index_id)?;
        anyhow::ensure!(
            handle.kind() == kind && handle.key_type() == key_type,
            "index {index_id} is ({:?}, {}) but was scanned as ({kind:?}, {key_type})",
            handle.kind(),
            handle.key_type()
        );
        let ids = handle.scan(entry, batch)?;
        let out = unsafe { ctx.arena().slice_mut(out_addr, 4 * ids.len())? };
        for (slot, id) in out.chunks_exact_mut(4).zip(&ids) {
            slot.copy_from_slice(&id.to_le_bytes());
        }
        Ok(())
    }
}

macro_rules! index_seek_abi {
    ($($name:ident => ($kind:ident, $bound:ident, $wty:ty, $raw:ident);)*) => {
        impl WasmInstanceEnv {$(
            pub fn $name(
                caller: Caller<'_, WasmInstanceEnv>,
                index_id: u64,
                key: $wty,
            ) -> anyhow::Result<u32> {
                Self::index_seek(
                    caller,
                    index_id,
                    IndexKind::$kind,
                    SeekBound::$bound,
                    RawKey::$raw(key),
                )
            }
        )*}
    };
}

index_seek_abi! {
    idx_lower_bound_array_b => (Array, Lower, u32, Bool);
    idx_upper_bound_array_b => (Array, Upper, u32, Bool);
    idx_lower_bound_array_i1 => (Array, Lower, i32, I8);
    idx_upper_bound_array_i1 => (Array, Upper, i32, I8);
    idx_lower_bound_array_i2 => (Array, Lower, i32, I16);
    idx_upper_bound_array_i2 => (Array, Upper, i32, I16);
    idx_lower_bound_array_i4 => (Array, Lower, i32, I32);
    idx_upper_bound_array_i4 => (Array, Upper, i32, I32);
    idx_lower_bound_array_i8 => (Array, Lower, i64, I64);
    idx_upper_bound_array_i8 => (Array, Upper, i64, I64);
    idx_lower_bound_array_f => (Array, Lower, f32, F32);
    idx_upper_bound_array_f => (Array, Upper, f32, F32);
    idx_lower_bound_array_d => (Array, Lower, f64, F64);
    idx_upper_bound_array_d => (Array, Upper, f64, F64);
    idx_lower_bound_array_p => (Array, Lower, u32, Str);
    idx_upper_bound_array_p => (Array, Upper, u32, Str);
    idx_lower_bound_rmi_i1 => (RecursiveModel, Lower, i32, I8);
    idx_upper_bound_rmi_i1 => (RecursiveModel, Upper, i32, I8);
    idx_lower_bound_rmi_i2 => (RecursiveModel, Lower, i32, I16);
    idx_upper_bound_rmi_i2 => (RecursiveModel, Upper, i32, I16);
    idx_lower_bound_rmi_i4 => (RecursiveModel, Lower, i32, I32);
    idx_upper_bound_rmi_i4 => (RecursiveModel, Upper, i32, I32);
    idx_lower_bound_rmi_i8 => (RecursiveModel, Lower, i64, I64);
    idx_upper_bound_rmi_i8 => (RecursiveModel, Upper, i64, I64);
    idx_lower_bound_rmi_f => (RecursiveModel, Lower, f32, F32);
    idx_upper_bound_rmi_f => (RecursiveModel, Upper, f32, F32);
    idx_lower_bound_rmi_d => (RecursiveModel, Lower, f64, F64);
    idx_upper_bound_rmi_d => (RecursiveModel, Upper, f64, F64);
}

macro_rules! index_scan_abi {
    ($($name:ident => ($kind:ident, $kt:ident);)*) => {
        impl WasmInstanceEnv {$(
            pub fn $name(
                caller: Caller<'_, WasmInstanceEnv>,
                index_id: u64,
                entry: u32,
                out_addr: u32,
                batch: u32,
            ) -> anyhow::Result<()> {
                Self::index_scan(
                    caller,
                    index_id,
                    IndexKind::$kind,
                    KeyType::$kt,
                    entry,
                    out_addr,
                    batch,
                )
            }
        )*}
    };
}

index_scan_abi! {
    idx_scan_array_b => (Array, Bool);
    idx_scan_array_i1 => (Array, I8);
    idx_scan_array_i2 => (Array, I16);
    idx_scan_array_i4 => (Array, I32);
    idx_scan_array_i8 => (Array, I64);
    idx_scan_array_f => (Array, F32);
    idx_scan_array_d => (Array, F64);
    idx_scan_array_p => (Array, Str);
    idx_scan_rmi_i1 => (RecursiveModel, I8);
    idx_scan_rmi_i2 => (RecursiveModel, I16);
    idx_scan_rmi_i4 => (RecursiveModel, I32);
    idx_scan_rmi_i8 => (RecursiveModel, I64);
    idx_scan_rmi_f => (RecursiveModel, F32);
    idx_scan_rmi_d => (RecursiveModel, F64);
}

macro_rules! abi_funcs {
    ($mac:ident) => {
        $mac! {
            print,
            print_memory_consumption,
            insist,
            throw,
            read_result_set,
            idx_lower_bound_array_b, idx_upper_bound_array_b, idx_scan_array_b,
            idx_lower_bound_array_i1, idx_upper_bound_array_i1, idx_scan_array_i1,
            idx_lower_bound_array_i2, idx_upper_bound_array_i2, idx_scan_array_i2,
            idx_lower_bound_array_i4, idx_upper_bound_array_i4, idx_scan_array_i4,
            idx_lower_bound_array_i8, idx_upper_bound_array_i8, idx_scan_array_i8,
            idx_lower_bound_array_f, idx_upper_bound_array_f, idx_scan_array_f,
            idx_lower_bound_array_d, idx_upper_bound_array_d, idx_scan_array_d,
            idx_lower_bound_array_p, idx_upper_bound_array_p, idx_scan_array_p,
            idx_lower_bound_rmi_i1, idx_upper_bound_rmi_i1, idx_scan_rmi_i1,
            idx_lower_bound_rmi_i2, idx_upper_bound_rmi_i2, idx_scan_rmi_i2,
            idx_lower_bound_rmi_i4, idx_upper_bound_rmi_i4, idx_scan_rmi_i4,
            idx_lower_bound_rmi_i8, idx_upper_bound_rmi_i8, idx_scan_rmi_i8,
            idx_lower_bound_rmi_f, idx_upper_bound_rmi_f, idx_scan_rmi_f,
            idx_lower_bound_rmi_d, idx_upper_bound_rmi_d, idx_scan_rmi_d,
        }
    };
}

/// Installs every host callback on the linker under its canonical name.
pub fn link_imports(linker: &mut Linker<WasmInstanceEnv>) -> anyhow::Result<()> {
    macro_rules! link_functions {
        ($($func:ident,)*) => {
            linker$(.func_wrap(crate::module::IMPORT_MODULE, stringify!($func), WasmInstanceEnv::$func)?)*;
        };
    }
    abi_funcs!(link_functions);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_abi_function_links() {
        let engine = wasmtime::Engine::default();
        let mut linker = Linker::<WasmInstanceEnv>::new(&engine);
        link_imports(&mut linker).unwrap();
    }

    #[test]
    fn import_registration_covers_the_dispatch_table() {
        let mut b = ModuleBuilder::new(1);
        let abi = AbiImports::register(&mut b);
        // 5 singletons + (8 array + 6 rmi) key types * 3 operations.
        assert_eq!(abi.seek_ids.len(), 28);
        assert_eq!(abi.scan_ids.len(), 14);
        assert_eq!(
            abi.seek(IndexKind::Array, KeyType::I32, SeekBound::Lower) as usize + 1,
            abi.seek(IndexKind::Array, KeyType::I32, SeekBound::Upper) as usize
        );
    }

    #[test]
    fn suffixes_follow_the_naming_convention() {
        assert_eq!(key_suffix(KeyType::I8), "i1");
        assert_eq!(key_suffix(KeyType::I64), "i8");
        assert_eq!(key_suffix(KeyType::F32), "f");
        assert_eq!(key_suffix(KeyType::F64), "d");
        assert_eq!(key_suffix(KeyType::Str), "p");
    }
}
