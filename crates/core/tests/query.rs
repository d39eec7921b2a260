//! End-to-end queries through the full backend: plan in, module emitted,
//! instantiated over the arena, rows back out through the sinks.

use quern_core::codegen::RuntimeEnv;
use quern_core::{BackendError, BackendOptions, ContextConfig, QueryIndex, WasmBackend};
use quern_lib::expr::{BinOp, Clause, Cnf, Expr};
use quern_lib::layout::RowMajorFactory;
use quern_lib::plan::{Operator, PhysicalPlan, PrintSink, TupleCallback};
use quern_lib::schema::Schema;
use quern_lib::store::{Column, RowStore, Table};
use quern_lib::tuple::Tuple;
use quern_lib::types::Type;
use quern_lib::value::{pack_date, Value};
use std::sync::{Arc, Mutex};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn backend() -> WasmBackend {
    init_logging();
    let mut options = BackendOptions::default();
    // Keep per-test arenas small; the default reservation is per query.
    options.vm_size = 64 * 64 * 1024;
    quern_core::register(options).expect("backend initializes")
}

fn sink() -> (PrintSink, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::new()));
    (buf.clone() as PrintSink, buf)
}

fn sink_text(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buf.lock().unwrap().clone()).unwrap()
}

fn people_store() -> Arc<RowStore> {
    let table = Arc::new(Table::new(
        "t",
        vec![
            Column::new("id", Type::I32),
            Column::new("name", Type::Char(8)),
        ],
    ));
    let mut store = RowStore::new(table);
    store
        .append(&[Some(Value::Int(1)), Some(Value::Str("a".into()))])
        .unwrap();
    store
        .append(&[Some(Value::Int(2)), Some(Value::Str("b".into()))])
        .unwrap();
    Arc::new(store)
}

#[test]
fn scan_and_print() {
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(people_store(), "t")
            .project(vec![
                (Expr::column("t.id", Type::I32), None),
                (Expr::column("t.name", Type::Char(8)), None),
            ])
            .print(out),
    ));
    let rows = backend.execute(&plan).unwrap();
    assert_eq!(rows, 2);
    assert_eq!(sink_text(&buf), "1,\"a\"\n2,\"b\"\n2 rows\n");
}

#[test]
fn constant_only_query_emits_count_identical_rows() {
    // SELECT 1, 'x', NULL over a table with three rows.
    let table = Arc::new(Table::new("u", vec![Column::new("k", Type::I32)]));
    let mut store = RowStore::new(table);
    for k in 0..3 {
        store.append(&[Some(Value::Int(k))]).unwrap();
    }
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "u")
            .project(vec![
                (Expr::int(1), None),
                (Expr::str("x"), None),
                (Expr::null(), None),
            ])
            .print(out),
    ));
    let rows = backend.execute(&plan).unwrap();
    assert_eq!(rows, 3);
    assert_eq!(sink_text(&buf), "1,\"x\",NULL\n".repeat(3) + "3 rows\n");
}

#[test]
fn duplicated_identifiers_fan_out_from_one_payload_column() {
    // SELECT id, id FROM t over the single row (7).
    let table = Arc::new(Table::new("d", vec![Column::new("id", Type::I32)]));
    let mut store = RowStore::new(table);
    store.append(&[Some(Value::Int(7))]).unwrap();
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "d")
            .project(vec![
                (Expr::column("d.id", Type::I32), None),
                (Expr::column("d.id", Type::I32), None),
            ])
            .print(out),
    ));
    let rows = backend.execute(&plan).unwrap();
    assert_eq!(rows, 1);
    assert_eq!(sink_text(&buf), "7,7\n1 rows\n");
}

#[test]
fn filter_limit_and_offset() {
    let table = Arc::new(Table::new("n", vec![Column::new("v", Type::I32)]));
    let mut store = RowStore::new(table);
    for v in 0..10 {
        store.append(&[Some(Value::Int(v))]).unwrap();
    }
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "n")
            .filter(Cnf::single(Expr::cmp(
                BinOp::Ge,
                Expr::column("n.v", Type::I32),
                Expr::int(4),
            )))
            .limit(3, 1)
            .print(out),
    ));
    let rows = backend.execute(&plan).unwrap();
    assert_eq!(rows, 3);
    assert_eq!(sink_text(&buf), "5\n6\n7\n3 rows\n");
}

#[test]
fn string_equality_filter_uses_the_mapped_literal() {
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(people_store(), "t")
            .filter(Cnf::single(Expr::cmp(
                BinOp::Eq,
                Expr::column("t.name", Type::Char(8)),
                Expr::str("b"),
            )))
            .print(out),
    ));
    let rows = backend.execute(&plan).unwrap();
    assert_eq!(rows, 1);
    assert_eq!(sink_text(&buf), "2,\"b\"\n1 rows\n");
}

#[test]
fn disjunctive_filter_passes_either_branch() {
    let table = Arc::new(Table::new("n", vec![Column::new("v", Type::I32)]));
    let mut store = RowStore::new(table);
    for v in 0..6 {
        store.append(&[Some(Value::Int(v))]).unwrap();
    }
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "n")
            .disjunctive_filter(Cnf::any_of(vec![
                Expr::cmp(BinOp::Eq, Expr::column("n.v", Type::I32), Expr::int(1)),
                Expr::cmp(BinOp::Eq, Expr::column("n.v", Type::I32), Expr::int(4)),
            ]))
            .print(out),
    ));
    assert_eq!(backend.execute(&plan).unwrap(), 2);
    assert_eq!(sink_text(&buf), "1\n4\n2 rows\n");
}

#[test]
fn null_columns_survive_the_round_trip() {
    let table = Arc::new(Table::new(
        "m",
        vec![Column::new("a", Type::I32), Column::new("b", Type::I32)],
    ));
    let mut store = RowStore::new(table);
    store.append(&[Some(Value::Int(1)), None]).unwrap();
    store.append(&[None, Some(Value::Int(2))]).unwrap();
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "m").print(out),
    ));
    assert_eq!(backend.execute(&plan).unwrap(), 2);
    assert_eq!(sink_text(&buf), "1,NULL\nNULL,2\n2 rows\n");
}

#[test]
fn date_and_datetime_formatting() {
    let table = Arc::new(Table::new(
        "w",
        vec![Column::new("d", Type::Date), Column::new("ts", Type::DateTime)],
    ));
    let mut store = RowStore::new(table);
    store
        .append(&[
            Some(Value::Date(pack_date(2024, 1, 31))),
            Some(Value::DateTime(0)),
        ])
        .unwrap();
    store
        .append(&[Some(Value::Date(pack_date(-5, 3, 2))), None])
        .unwrap();
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "w").print(out),
    ));
    assert_eq!(backend.execute(&plan).unwrap(), 2);
    assert_eq!(
        sink_text(&buf),
        "2024-01-31,1970-01-01 00:00:00\n-0005-03-02,NULL\n2 rows\n"
    );
}

#[test]
fn callback_sink_receives_typed_tuples() {
    let rows: Arc<Mutex<Vec<(usize, Vec<Option<Value>>)>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = rows.clone();
    let callback: TupleCallback = Arc::new(Mutex::new(move |schema: &Schema, tup: &Tuple| {
        collected.lock().unwrap().push((
            schema.num_entries(),
            tup.iter().map(|v| v.cloned()).collect(),
        ));
    }));
    let backend = backend();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(people_store(), "t").callback(callback),
    ));
    assert_eq!(backend.execute(&plan).unwrap(), 2);
    let rows = rows.lock().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, 2);
    assert_eq!(
        rows[0].1,
        vec![Some(Value::Int(1)), Some(Value::Str("a".into()))]
    );
    assert_eq!(
        rows[1].1,
        vec![Some(Value::Int(2)), Some(Value::Str("b".into()))]
    );
}

#[test]
fn noop_root_counts_without_materializing() {
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(people_store(), "t").no_op(out),
    ));
    assert_eq!(backend.execute(&plan).unwrap(), 2);
    assert_eq!(sink_text(&buf), "2 rows\n");
}

#[test]
fn quiet_suppresses_the_row_trailer() {
    init_logging();
    let mut options = BackendOptions::default();
    options.vm_size = 64 * 64 * 1024;
    options.quiet = true;
    let backend = WasmBackend::new(options).unwrap();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(people_store(), "t").print(out),
    ));
    assert_eq!(backend.execute(&plan).unwrap(), 2);
    assert_eq!(sink_text(&buf), "1,\"a\"\n2,\"b\"\n");
}

#[test]
fn context_registry_returns_to_its_previous_size() {
    let backend = backend();
    let before = quern_core::context::live_contexts();
    for _ in 0..3 {
        let (out, _buf) = sink();
        let plan = Arc::new(PhysicalPlan::new(
            Operator::scan(people_store(), "t").print(out),
        ));
        backend.execute(&plan).unwrap();
    }
    assert_eq!(quern_core::context::live_contexts(), before);
}

#[test]
fn registry_is_restored_even_when_the_query_fails() {
    let backend = backend();
    let before = quern_core::context::live_contexts();
    let (out, _buf) = sink();
    // 1 / v throws on the row v = 0.
    let table = Arc::new(Table::new("z", vec![Column::new("v", Type::I32)]));
    let mut store = RowStore::new(table);
    store.append(&[Some(Value::Int(0))]).unwrap();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "z")
            .project(vec![(
                Expr::Binary {
                    op: BinOp::Div,
                    lhs: Box::new(Expr::int(1)),
                    rhs: Box::new(Expr::column("z.v", Type::I32)),
                    ty: Type::I32,
                },
                Some("q".into()),
            )])
            .print(out),
    ));
    let err = backend.execute(&plan).unwrap_err();
    match err {
        BackendError::Guest(exc) => {
            assert_eq!(exc.kind, quern_core::ExceptionKind::DivisionByZero);
            assert!(exc.line > 0);
        }
        other => panic!("expected a guest exception, got {other}"),
    }
    assert_eq!(quern_core::context::live_contexts(), before);
}

#[test]
fn equality_filter_rides_the_array_index() {
    let table = Arc::new(Table::new("k", vec![Column::new("key", Type::I32)]));
    let mut store = RowStore::new(table);
    for key in [1, 3, 3, 5] {
        store.append(&[Some(Value::Int(key))]).unwrap();
    }
    let store = Arc::new(store);
    let index = store.build_array_index("key").unwrap();
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(store, "k")
            .filter(Cnf::single(Expr::cmp(
                BinOp::Eq,
                Expr::column("k.key", Type::I32),
                Expr::int(3),
            )))
            .print(out),
    ));
    let rows = backend
        .execute_with_indexes(
            &plan,
            vec![QueryIndex {
                table: "k".into(),
                column: "key".into(),
                handle: index,
            }],
        )
        .unwrap();
    assert_eq!(rows, 2);
    assert_eq!(sink_text(&buf), "3\n3\n2 rows\n");
}

#[test]
fn equality_filter_rides_the_recursive_model_index() {
    let table = Arc::new(Table::new("r", vec![Column::new("key", Type::I64)]));
    let mut store = RowStore::new(table);
    for key in 0..512i64 {
        store.append(&[Some(Value::Int(key * 2))]).unwrap();
    }
    let store = Arc::new(store);
    let index = store.build_rmi_index("key").unwrap();
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(store, "r")
            .filter(Cnf::single(Expr::cmp(
                BinOp::Eq,
                Expr::column("r.key", Type::I64),
                Expr::Constant {
                    value: Some(Value::Int(100)),
                    ty: Type::I64,
                },
            )))
            .print(out),
    ));
    let rows = backend
        .execute_with_indexes(
            &plan,
            vec![QueryIndex {
                table: "r".into(),
                column: "key".into(),
                handle: index,
            }],
        )
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(sink_text(&buf), "100\n1 rows\n");
}

#[test]
fn round_trip_matches_the_stored_values() {
    let table = Arc::new(Table::new(
        "all",
        vec![
            Column::new("b", Type::Bool),
            Column::new("i", Type::I64),
            Column::new("f", Type::F64),
            Column::new("s", Type::Char(6)),
        ],
    ));
    let mut store = RowStore::new(table);
    let expect: Vec<Vec<Option<Value>>> = (0..4)
        .map(|i| {
            vec![
                Some(Value::Bool(i % 2 == 0)),
                Some(Value::Int(i * 1000 - 7)),
                Some(Value::Float(i as f64 / 4.0)),
                Some(Value::Str(format!("r{i}"))),
            ]
        })
        .collect();
    for row in &expect {
        store.append(row).unwrap();
    }
    let rows: Arc<Mutex<Vec<Vec<Option<Value>>>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = rows.clone();
    let callback: TupleCallback = Arc::new(Mutex::new(move |_: &Schema, tup: &Tuple| {
        collected
            .lock()
            .unwrap()
            .push(tup.iter().map(|v| v.cloned()).collect());
    }));
    let backend = backend();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "all").callback(callback),
    ));
    assert_eq!(backend.execute(&plan).unwrap(), 4);
    assert_eq!(*rows.lock().unwrap(), expect);
}

#[test]
fn compiled_module_exports_main_and_the_table_globals() {
    let backend = backend();
    let (out, _buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(people_store(), "t").print(out),
    ));
    let bytes = backend.compile(&plan).unwrap();
    let wat = quern_core::module::render_wat(&bytes);
    assert!(wat.contains("(export \"main\""));
    assert!(wat.contains("(export \"memory\""));
    assert!(wat.contains("\"t_mem\""));
    assert!(wat.contains("\"t_num_rows\""));
    assert!(wat.contains("\"read_result_set\""));
}

#[test]
fn unsupported_pipelines_are_rejected_with_a_typed_error() {
    let backend = backend();
    let (out, _buf) = sink();
    let scan = Operator::scan(people_store(), "t");
    let schema = scan.schema().clone();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::Sorting(quern_lib::plan::SortingOp {
            order_by: vec![(Expr::column("t.id", Type::I32), true)],
            child: Box::new(scan),
            schema,
        })
        .print(out),
    ));
    let err = backend.execute(&plan).unwrap_err();
    assert!(matches!(
        err,
        BackendError::Codegen(quern_core::codegen::CodegenError::UnsupportedPipeline("Sorting"))
    ));
}

/// Scenario: generated code whose `insist` fails must abort the process
/// with the recorded provenance on stderr. Run in a subprocess.
#[test]
fn guest_insist_aborts_the_process() {
    use quern_core::abi::AbiImports;
    use quern_core::module::ModuleBuilder;
    use wasm_encoder::{Function, Instruction, ValType};

    if std::env::var_os("QUERN_INSIST_CHILD").is_some() {
        let vm_size = 64 * 64 * 1024;
        let mut builder = ModuleBuilder::new((vm_size / (64 * 1024)) as u64);
        let abi = AbiImports::register(&mut builder);
        let main = builder.reserve_func(&[ValType::I32], &[ValType::I32]);
        builder.export_func(main, "main");
        let msg = builder.add_message("forced failure");
        let mut body = Function::new([]);
        body.instruction(&Instruction::I64Const(msg as i64))
            .instruction(&Instruction::Call(abi.insist))
            .instruction(&Instruction::I32Const(0))
            .instruction(&Instruction::End);
        builder.set_body(main, body);
        let bytes = builder.finish().unwrap();

        let (out, _buf) = sink();
        let plan = Arc::new(PhysicalPlan::new(
            Operator::scan(people_store(), "t").print(out),
        ));
        let mut ctx = quern_core::WasmContext::new(
            builder.id(),
            plan,
            ContextConfig::default(),
            vm_size,
            Arc::new(RowMajorFactory),
        )
        .unwrap();
        ctx.set_messages(builder.take_messages());
        let backend = backend();
        // Aborts inside `main`; anything past this line is a test failure.
        let _ = backend.execute_module(&bytes, ctx, &RuntimeEnv::default());
        unreachable!("insist must abort the process");
    }

    let exe = std::env::current_exe().unwrap();
    let output = std::process::Command::new(exe)
        .args(["--exact", "guest_insist_aborts_the_process", "--nocapture"])
        .env("QUERN_INSIST_CHILD", "1")
        .output()
        .unwrap();
    assert!(
        !output.status.success(),
        "child must die by abort, got {:?}",
        output.status
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("assertion in generated code failed"),
        "stderr: {stderr}"
    );
    assert!(stderr.contains(".rs:"), "provenance expected: {stderr}");
    assert!(stderr.contains("forced failure"), "stderr: {stderr}");
}

#[test]
fn print_line_count_matches_the_returned_row_count() {
    let table = Arc::new(Table::new("c", vec![Column::new("v", Type::I16)]));
    let mut store = RowStore::new(table);
    for v in 0..37 {
        store.append(&[Some(Value::Int(v))]).unwrap();
    }
    let backend = backend();
    let (out, buf) = sink();
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "c")
            .filter(Cnf(vec![Clause(vec![Expr::cmp(
                BinOp::Lt,
                Expr::column("c.v", Type::I16),
                Expr::int(21),
            )])]))
            .print(out),
    ));
    let rows = backend.execute(&plan).unwrap() as usize;
    let text = sink_text(&buf);
    let lines = text.lines().count() - 1; // minus the rows trailer
    assert_eq!(lines, rows);
    assert_eq!(rows, 21);
}
