//! The WebAssembly execution backend of the quern in-memory analytical
//! database.
//!
//! Given a matched physical plan, the backend emits a Wasm module whose
//! `main` runs the plan's pipelines, instantiates it inside an embedded
//! engine whose linear memory aliases the query's virtual-memory arena, and
//! materializes the result set back to the plan's sink.
//!
//! ```no_run
//! use quern_core::{BackendOptions, WasmBackend};
//! use quern_lib::plan::{Operator, PhysicalPlan};
//! use quern_lib::store::{Column, RowStore, Table};
//! use quern_lib::types::Type;
//! use std::sync::{Arc, Mutex};
//!
//! let table = Arc::new(Table::new("t", vec![Column::new("id", Type::I32)]));
//! let store = Arc::new(RowStore::new(table));
//! let sink = Arc::new(Mutex::new(Vec::new()));
//! let plan = Arc::new(PhysicalPlan::new(
//!     Operator::scan(store, "t").print(sink.clone()),
//! ));
//!
//! let backend = quern_core::register(BackendOptions::default())?;
//! let rows = backend.execute(&plan)?;
//! # anyhow::Ok(())
//! ```

pub mod abi;
pub mod arena;
pub mod codegen;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod module;
pub mod result;

pub use config::{BackendOptions, ContextConfig};
pub use context::{QueryIndex, WasmContext};
pub use engine::{register, WasmBackend, BACKEND_NAME};
pub use error::{BackendError, ExceptionKind, GuestException};
