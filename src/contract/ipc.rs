//! JSON-RPC client for the external contract execution process.
//!
//! The executor listens on a Unix domain socket and speaks newline-delimited
//! JSON-RPC 2.0. A fresh connection is made per call; the process on the
//! other side owns all interpreter state, the core only ships requests and
//! state fragments across.

use crate::contract::ContractStorageError;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Per-request timeout for executor calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

/// Client handle for the contract execution process.
pub struct ExecClient {
    socket_path: PathBuf,
    request_id: AtomicU64,
}

impl ExecClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            request_id: AtomicU64::new(1),
        }
    }

    fn call(&self, method: &str, params: Value) -> Result<Value, ContractStorageError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };

        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| ContractStorageError::Ipc(format!("connect failed: {e}")))?;
        stream
            .set_read_timeout(Some(CALL_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(CALL_TIMEOUT)))
            .map_err(|e| ContractStorageError::Ipc(format!("socket setup failed: {e}")))?;

        let mut body = serde_json::to_vec(&request)
            .map_err(|e| ContractStorageError::Ipc(format!("request encode failed: {e}")))?;
        body.push(b'\n');
        stream
            .write_all(&body)
            .map_err(|e| ContractStorageError::Ipc(format!("write failed: {e}")))?;

        let mut line = String::new();
        BufReader::new(stream)
            .read_line(&mut line)
            .map_err(|e| ContractStorageError::Ipc(format!("read failed: {e}")))?;

        let response: Value = serde_json::from_str(&line)
            .map_err(|e| ContractStorageError::Ipc(format!("response parse failed: {e}")))?;

        if let Some(err) = response.get("error")
            && !err.is_null()
        {
            return Err(ContractStorageError::Ipc(format!(
                "{method} returned error: {err}"
            )));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| ContractStorageError::Ipc(format!("{method} returned no result")))
    }

    /// Invokes the executor's sharding merger for the given interpreter
    /// version. Returns the merger response, expected to carry `states`
    /// (and optionally `timing`).
    pub fn call_sharding(
        &self,
        version: u32,
        req: &Value,
    ) -> Result<Value, ContractStorageError> {
        let req_str = serde_json::to_string(req)
            .map_err(|e| ContractStorageError::Ipc(format!("merge request encode failed: {e}")))?;
        let result = self.call(
            "CallSharding",
            serde_json::json!([version, { "req": req_str }]),
        )?;
        // Some executor builds return the merge response as a JSON string.
        match result {
            Value::String(s) => serde_json::from_str(&s)
                .map_err(|e| ContractStorageError::Ipc(format!("merge response parse failed: {e}"))),
            other => Ok(other),
        }
    }

    /// Runs the contract checker over freshly deployed code.
    pub fn check_contract(&self, version: u32, req: &Value) -> Result<Value, ContractStorageError> {
        self.call("CheckContract", serde_json::json!([version, req]))
    }

    /// Executes a contract transition.
    pub fn run_contract(&self, version: u32, req: &Value) -> Result<Value, ContractStorageError> {
        self.call("RunContract", serde_json::json!([version, req]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::thread;

    fn spawn_echo_server(path: &Path, result: Value) -> thread::JoinHandle<Value> {
        let listener = UnixListener::bind(path).expect("bind test socket");
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            reader.read_line(&mut line).expect("read request");
            let request: Value = serde_json::from_str(&line).expect("parse request");

            let response = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": result,
            });
            let mut stream = stream;
            let mut body = serde_json::to_vec(&response).unwrap();
            body.push(b'\n');
            stream.write_all(&body).expect("write response");
            request
        })
    }

    #[test]
    fn call_sharding_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.sock");
        let handle = spawn_echo_server(&path, json!({"states": {"k": "v"}}));

        let client = ExecClient::new(&path);
        let resp = client
            .call_sharding(0, &json!({"req_type": "join"}))
            .expect("call");
        assert_eq!(resp["states"]["k"], "v");

        let request = handle.join().unwrap();
        assert_eq!(request["method"], "CallSharding");
        assert_eq!(request["params"][0], 0);
    }

    #[test]
    fn string_wrapped_merge_response_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exec.sock");
        let wrapped = Value::String("{\"states\":{}}".to_string());
        let handle = spawn_echo_server(&path, wrapped);

        let client = ExecClient::new(&path);
        let resp = client.call_sharding(1, &json!({})).expect("call");
        assert!(resp["states"].is_object());
        handle.join().unwrap();
    }

    #[test]
    fn connect_failure_is_ipc_error() {
        let client = ExecClient::new("/nonexistent/exec.sock");
        let err = client.call_sharding(0, &json!({})).unwrap_err();
        assert!(matches!(err, ContractStorageError::Ipc(_)));
    }
}
