//! The optional remote inspector.
//!
//! Never taken in production: only a configured debug port >= 1024 routes a
//! query through here. The driver hands over the emitted module bytes and
//! the runtime environment; this module writes a JS bootstrap that a
//! debugger frontend can step through (it compiles the module, binds the
//! host environment into an import object, and calls `main`), then serves a
//! WebSocket session speaking the debugger protocol. Execution is held
//! until the frontend sends `Runtime.runIfWaitingForDebugger`; bounds and
//! stack checking stay at the engine's defaults on this path.

use crate::context::ContextId;
use crate::error::BackendError;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::net::TcpListener;
use thiserror::Error;
use tungstenite::Message;

#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("cannot bind the inspector WebSocket on port {port}")]
    Bind { port: u16, source: std::io::Error },
    #[error("cannot accept a debugger connection")]
    Accept { source: std::io::Error },
    #[error("inspector WebSocket handshake failed: {0}")]
    Handshake(String),
    #[error("inspector connection failed")]
    Connection(#[from] tungstenite::Error),
    #[error("debugger disconnected before resuming execution")]
    Disconnected,
    #[error("cannot write the debug bootstrap script")]
    Bootstrap(#[source] std::io::Error),
}

/// Serves one debug session and runs the query once the frontend asks for
/// it. Returns the row count `run` produced.
pub fn run_inspector(
    port: u16,
    module_bytes: &[u8],
    env: &serde_json::Map<String, Value>,
    ctx_id: ContextId,
    run: impl FnOnce() -> Result<u32, BackendError>,
) -> Result<u32, BackendError> {
    let script = bootstrap_script(module_bytes, env, ctx_id);
    let path = std::env::temp_dir().join("query.js");
    std::fs::write(&path, script).map_err(InspectorError::Bootstrap)?;
    log::info!("created debug bootstrap script at {}", path.display());

    let listener = TcpListener::bind(("127.0.0.1", port))
        .map_err(|source| InspectorError::Bind { port, source })?;
    println!(
        "Initiating the inspector server.  To attach, point a debugger frontend at\n\n\t\
         ws=127.0.0.1:{port}\n"
    );

    let (stream, peer) = listener
        .accept()
        .map_err(|source| InspectorError::Accept { source })?;
    log::info!("debugger attached from {peer}");
    let mut socket =
        tungstenite::accept(stream).map_err(|e| InspectorError::Handshake(e.to_string()))?;

    let mut run = Some(run);
    let mut rows = None;
    loop {
        let msg = match socket.read() {
            Ok(msg) => msg,
            Err(tungstenite::Error::ConnectionClosed) => break,
            Err(e) => return Err(InspectorError::Connection(e).into()),
        };
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        // Acknowledge every command so the frontend keeps talking to us.
        if let Some(id) = frame.get("id") {
            let ack = json!({ "id": id, "result": {} });
            socket
                .send(Message::Text(ack.to_string()))
                .map_err(InspectorError::Connection)?;
        }
        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
        match method {
            "Runtime.runIfWaitingForDebugger" => {
                let Some(run) = run.take() else { break };
                let n = run()?;
                let note = json!({
                    "method": "Runtime.consoleAPICalled",
                    "params": {
                        "type": "log",
                        "args": [{
                            "type": "string",
                            "value": format!("The result set contains {n} tuples."),
                        }],
                    },
                });
                socket
                    .send(Message::Text(note.to_string()))
                    .map_err(InspectorError::Connection)?;
                rows = Some(n);
            }
            "Inspector.detach" | "Runtime.terminateExecution" => break,
            _ => {}
        }
        if rows.is_some() {
            break;
        }
    }
    let _ = socket.close(None);
    rows.ok_or(InspectorError::Disconnected.into())
}

/// The JS bootstrap a debugger frontend executes: module bytes inline, the
/// host environment as an import object, and a `main` invocation.
fn bootstrap_script(
    module_bytes: &[u8],
    env: &serde_json::Map<String, Value>,
    ctx_id: ContextId,
) -> String {
    let mut bytes = String::new();
    for (i, b) in module_bytes.iter().enumerate() {
        if i != 0 {
            bytes.push_str(", ");
        }
        let _ = write!(bytes, "{b}");
    }
    let mut env_str = serde_json::to_string(env).unwrap_or_else(|_| "{}".into());
    if env_str != "{}" {
        env_str.insert(env_str.len() - 1, ',');
    }
    env_str.insert_str(
        env_str.len() - 1,
        "\"insist\": function (arg) { console.assert(arg); },\
         \"print\": function (arg) { console.log(arg); },\
         \"throw\": function (ex) { console.error(ex); }",
    );

    format!(
        "let importObject = {{ \"env\": {env_str} }};\n\
         const bytes = Uint8Array.from([{bytes}]);\n\
         WebAssembly.compile(bytes).then(\n\
             (module) => WebAssembly.instantiate(module, importObject),\n\
             (error) => console.error(`An error occurred during module compilation: ${{error}}`)\n\
         ).then(\n\
             function(instance) {{\n\
                 const num_tuples = instance.exports.main({ctx_id});\n\
                 console.log('The result set contains %i tuples.', num_tuples);\n\
                 debugger;\n\
             }},\n\
             (error) => console.error(`An error occurred during module instantiation: ${{error}}`)\n\
         );\n\
         debugger;\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_embeds_bytes_and_env() {
        let mut env = serde_json::Map::new();
        env.insert("t_mem".into(), 4096.into());
        let script = bootstrap_script(&[0, 97, 115, 109], &env, 7);
        assert!(script.contains("Uint8Array.from([0, 97, 115, 109])"));
        assert!(script.contains("\"t_mem\":4096"));
        assert!(script.contains("exports.main(7)"));
        assert!(script.contains("\"insist\""));
    }

    #[test]
    fn bootstrap_handles_empty_env() {
        let script = bootstrap_script(&[], &serde_json::Map::new(), 1);
        assert!(script.contains("\"print\""));
    }
}
