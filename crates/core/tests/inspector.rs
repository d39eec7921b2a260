//! The remote-debug path: execution must hold until the frontend sends
//! `Runtime.runIfWaitingForDebugger`, then run the query and report the
//! tuple count over the socket.

use quern_core::{BackendOptions, WasmBackend};
use quern_lib::plan::{Operator, PhysicalPlan, PrintSink};
use quern_lib::store::{Column, RowStore, Table};
use quern_lib::types::Type;
use quern_lib::value::Value;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tungstenite::Message;

const PORT: u16 = 9377;

#[test]
fn inspector_holds_execution_until_resumed() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut options = BackendOptions::default();
    options.vm_size = 64 * 64 * 1024;
    options.cdt_port = PORT;
    let backend = WasmBackend::new(options).unwrap();

    let table = Arc::new(Table::new("t", vec![Column::new("id", Type::I32)]));
    let mut store = RowStore::new(table);
    store.append(&[Some(Value::Int(1))]).unwrap();
    store.append(&[Some(Value::Int(2))]).unwrap();
    let buf = Arc::new(Mutex::new(Vec::new()));
    let plan = Arc::new(PhysicalPlan::new(
        Operator::scan(Arc::new(store), "t").print(buf.clone() as PrintSink),
    ));

    let worker = std::thread::spawn(move || backend.execute(&plan));

    // The server binds once `prepare` is done; retry until it listens.
    let mut socket = None;
    for _ in 0..200 {
        match tungstenite::connect(format!("ws://127.0.0.1:{PORT}")) {
            Ok((s, _)) => {
                socket = Some(s);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(25)),
        }
    }
    let mut socket = socket.expect("inspector server did not come up");

    let resume = json!({ "id": 1, "method": "Runtime.runIfWaitingForDebugger" });
    socket
        .send(Message::Text(resume.to_string()))
        .unwrap();

    let mut saw_note = false;
    for _ in 0..10 {
        match socket.read() {
            Ok(Message::Text(text)) if text.contains("tuples") => {
                assert!(text.contains("The result set contains 2 tuples."));
                saw_note = true;
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert!(saw_note, "no console notification from the inspector");

    let rows = worker.join().unwrap().unwrap();
    assert_eq!(rows, 2);
    let text = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    assert_eq!(text, "1\n2\n2 rows\n");
}
