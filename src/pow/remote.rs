//! JSON-RPC client for the remote mining proxy.
//!
//! Every request is signed over the concatenated raw field bytes so the
//! proxy can attribute work to a registered miner key. All byte fields ride
//! as `0x`-prefixed hex; integers are big-endian fixed-width before hex.

use crate::crypto::key_pair::PrivateKey;
use crate::pow::PowError;
use crate::types::hash::Hash;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Result of one `zil_checkWorkStatus` poll.
#[derive(Debug, Clone)]
pub struct WorkStatus {
    pub done: bool,
    pub nonce: u64,
    pub header: Hash,
    pub mix_hash: Hash,
}

/// Blocking JSON-RPC client for the mining proxy.
pub struct RemoteMiner {
    url: String,
    client: reqwest::blocking::Client,
    request_id: AtomicU64,
}

fn hex_field(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn parse_hash(value: &Value, what: &str) -> Result<Hash, PowError> {
    let text = value
        .as_str()
        .ok_or_else(|| PowError::InvalidResponse(format!("{what} is not a string")))?;
    let raw = hex::decode(text.trim_start_matches("0x"))
        .map_err(|e| PowError::InvalidResponse(format!("{what} is not hex: {e}")))?;
    Hash::from_slice(&raw).ok_or_else(|| {
        PowError::InvalidResponse(format!("{what} is not 32 bytes, got {}", raw.len()))
    })
}

impl RemoteMiner {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            url: url.into(),
            client,
            request_id: AtomicU64::new(1),
        }
    }

    fn call(&self, method: &str, params: Vec<String>) -> Result<Value, PowError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.request_id.fetch_add(1, Ordering::Relaxed),
        });

        let response: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .map_err(|e| PowError::Proxy(format!("{method} request failed: {e}")))?
            .json()
            .map_err(|e| PowError::Proxy(format!("{method} response is not JSON: {e}")))?;

        if let Some(err) = response.get("error")
            && !err.is_null()
        {
            return Err(PowError::Proxy(format!("{method} returned error: {err}")));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| PowError::InvalidResponse(format!("{method} returned no result")))
    }

    /// Submits a work package to the proxy.
    ///
    /// `zil_requestWork([pubkey, header, blockNum, boundary, window_secs, sig])`
    pub fn request_work(
        &self,
        key: &PrivateKey,
        block_num: u64,
        header: &Hash,
        boundary: &Hash,
        window_secs: u32,
    ) -> Result<bool, PowError> {
        let pubkey = key.public_key().to_bytes();
        let block_be = block_num.to_be_bytes();
        let window_be = window_secs.to_be_bytes();

        let mut signed = Vec::with_capacity(32 + 32 + 8 + 32 + 4);
        signed.extend_from_slice(&pubkey);
        signed.extend_from_slice(header.as_slice());
        signed.extend_from_slice(&block_be);
        signed.extend_from_slice(boundary.as_slice());
        signed.extend_from_slice(&window_be);
        let signature = key
            .try_sign(&signed)
            .map_err(|e| PowError::Signature(e.to_string()))?;

        let params = vec![
            hex_field(&pubkey),
            hex_field(header.as_slice()),
            hex_field(&block_be),
            hex_field(boundary.as_slice()),
            hex_field(&window_be),
            hex_field(&signature.to_bytes()),
        ];

        let result = self.call("zil_requestWork", params)?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Polls the proxy for a finished solution.
    ///
    /// `zil_checkWorkStatus([pubkey, header, boundary, sig])
    ///  -> [done, nonce_hex, header_hex, mixhash_hex]`
    pub fn check_work_status(
        &self,
        key: &PrivateKey,
        header: &Hash,
        boundary: &Hash,
    ) -> Result<WorkStatus, PowError> {
        let pubkey = key.public_key().to_bytes();

        let mut signed = Vec::with_capacity(32 + 32 + 32);
        signed.extend_from_slice(&pubkey);
        signed.extend_from_slice(header.as_slice());
        signed.extend_from_slice(boundary.as_slice());
        let signature = key
            .try_sign(&signed)
            .map_err(|e| PowError::Signature(e.to_string()))?;

        let params = vec![
            hex_field(&pubkey),
            hex_field(header.as_slice()),
            hex_field(boundary.as_slice()),
            hex_field(&signature.to_bytes()),
        ];

        let result = self.call("zil_checkWorkStatus", params)?;
        let fields = result
            .as_array()
            .ok_or_else(|| PowError::InvalidResponse("work status is not an array".into()))?;

        let done = fields
            .first()
            .and_then(Value::as_bool)
            .ok_or_else(|| PowError::InvalidResponse("work status has no done flag".into()))?;
        if !done {
            return Ok(WorkStatus {
                done: false,
                nonce: 0,
                header: *header,
                mix_hash: Hash::zero(),
            });
        }

        if fields.len() < 4 {
            return Err(PowError::InvalidResponse(format!(
                "work status array too short: {}",
                fields.len()
            )));
        }
        let nonce_text = fields[1]
            .as_str()
            .ok_or_else(|| PowError::InvalidResponse("nonce is not a string".into()))?;
        let nonce = u64::from_str_radix(nonce_text.trim_start_matches("0x"), 16)
            .map_err(|e| PowError::InvalidResponse(format!("nonce is not hex: {e}")))?;

        Ok(WorkStatus {
            done: true,
            nonce,
            header: parse_hash(&fields[2], "header")?,
            mix_hash: parse_hash(&fields[3], "mix hash")?,
        })
    }

    /// Reports the local verification outcome back to the proxy.
    ///
    /// `zil_verifyResult([pubkey, verified_u8, header, boundary, sig])`
    pub fn verify_result(
        &self,
        key: &PrivateKey,
        verified: bool,
        header: &Hash,
        boundary: &Hash,
    ) -> Result<bool, PowError> {
        let pubkey = key.public_key().to_bytes();
        let verified_byte = [verified as u8];

        let mut signed = Vec::with_capacity(32 + 1 + 32 + 32);
        signed.extend_from_slice(&pubkey);
        signed.extend_from_slice(&verified_byte);
        signed.extend_from_slice(header.as_slice());
        signed.extend_from_slice(boundary.as_slice());
        let signature = key
            .try_sign(&signed)
            .map_err(|e| PowError::Signature(e.to_string()))?;

        let params = vec![
            hex_field(&pubkey),
            hex_field(&verified_byte),
            hex_field(header.as_slice()),
            hex_field(boundary.as_slice()),
            hex_field(&signature.to_bytes()),
        ];

        let result = self.call("zil_verifyResult", params)?;
        Ok(result.as_bool().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// One-shot HTTP server answering a single JSON-RPC POST with `result`.
    fn spawn_proxy(result: Value) -> (String, thread::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut buf = vec![0u8; 64 * 1024];
            let mut read = 0;
            let body_start;
            loop {
                let n = stream.read(&mut buf[read..]).expect("read");
                read += n;
                if let Some(pos) = find_header_end(&buf[..read]) {
                    body_start = pos;
                    break;
                }
            }
            let headers = String::from_utf8_lossy(&buf[..body_start]).to_string();
            let content_length: usize = headers
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse().unwrap()))
                .unwrap_or(0);
            while read < body_start + content_length {
                let n = stream.read(&mut buf[read..]).expect("read body");
                read += n;
            }
            let request: Value =
                serde_json::from_slice(&buf[body_start..body_start + content_length])
                    .expect("parse request");

            let body = json!({"jsonrpc": "2.0", "id": request["id"], "result": result}).to_string();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).expect("write");
            request
        });
        (format!("http://{addr}"), handle)
    }

    fn find_header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    #[test]
    fn request_work_roundtrip() {
        let (url, handle) = spawn_proxy(json!(true));
        let miner = RemoteMiner::new(url);
        let key = PrivateKey::new();

        let accepted = miner
            .request_work(&key, 42, &Hash([1u8; 32]), &Hash([0x7F; 32]), 300)
            .expect("request");
        assert!(accepted);

        let request = handle.join().unwrap();
        assert_eq!(request["method"], "zil_requestWork");
        let params = request["params"].as_array().unwrap();
        assert_eq!(params.len(), 6);
        // Block number is big-endian fixed-width hex.
        assert_eq!(params[2], "0x000000000000002a");
        // Window seconds likewise.
        assert_eq!(params[4], "0x0000012c");
        assert!(params[1].as_str().unwrap().starts_with("0x01010101"));
    }

    #[test]
    fn check_work_status_parses_solution() {
        let (url, handle) = spawn_proxy(json!([
            true,
            "0x1f",
            format!("0x{}", "11".repeat(32)),
            format!("0x{}", "22".repeat(32)),
        ]));
        let miner = RemoteMiner::new(url);
        let key = PrivateKey::new();

        let status = miner
            .check_work_status(&key, &Hash([0x11; 32]), &Hash([0x7F; 32]))
            .expect("check");
        assert!(status.done);
        assert_eq!(status.nonce, 0x1f);
        assert_eq!(status.header, Hash([0x11; 32]));
        assert_eq!(status.mix_hash, Hash([0x22; 32]));
        handle.join().unwrap();
    }

    #[test]
    fn check_work_status_not_done() {
        let (url, handle) = spawn_proxy(json!([false]));
        let miner = RemoteMiner::new(url);
        let key = PrivateKey::new();

        let status = miner
            .check_work_status(&key, &Hash([0x11; 32]), &Hash([0x7F; 32]))
            .expect("check");
        assert!(!status.done);
        handle.join().unwrap();
    }

    #[test]
    fn proxy_error_is_reported() {
        // Nothing listening on this port.
        let miner = RemoteMiner::new("http://127.0.0.1:1");
        let key = PrivateKey::new();
        let err = miner
            .request_work(&key, 1, &Hash::zero(), &Hash::zero(), 1)
            .unwrap_err();
        assert!(matches!(err, PowError::Proxy(_)));
    }
}
