//! Node configuration for the state engine and the PoW miner.
//!
//! Values come from `Default` implementations with environment-variable
//! overrides, e.g. `MINING_MODE=remote MINING_PROXY_URL=http://proxy:4202`.

use std::env;
use std::path::PathBuf;

/// Nonce search strategy used by `PowEngine::pow_mine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningMode {
    /// Single-threaded CPU search with the light ethash context.
    LightCpu,
    /// Single-threaded CPU search with the precomputed full dataset.
    FullCpu,
    /// Fan out across configured device miners, one worker thread each.
    Devices,
    /// Delegate the search to a remote mining proxy over JSON-RPC.
    Remote,
}

/// Proof-of-work configuration.
#[derive(Debug, Clone)]
pub struct PowConfig {
    /// Which nonce search strategy `pow_mine` dispatches to.
    pub mode: MiningMode,
    /// JSON-RPC endpoint of the remote mining proxy.
    pub proxy_url: String,
    /// Seconds between `zil_checkWorkStatus` polls.
    pub check_interval_secs: u64,
    /// Mining window advertised to the proxy, in seconds.
    pub pow_window_secs: u32,
    /// Number of CPU device miners used in `Devices` mode.
    pub cpu_devices: usize,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            mode: MiningMode::LightCpu,
            proxy_url: "http://127.0.0.1:4202".to_string(),
            check_interval_secs: 5,
            pow_window_secs: 300,
            cpu_devices: 1,
        }
    }
}

impl PowConfig {
    /// Builds a configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        match env::var("MINING_MODE").as_deref() {
            Ok("full") => cfg.mode = MiningMode::FullCpu,
            Ok("devices") => cfg.mode = MiningMode::Devices,
            Ok("remote") => cfg.mode = MiningMode::Remote,
            _ => {}
        }
        if let Ok(url) = env::var("MINING_PROXY_URL") {
            cfg.proxy_url = url;
        }
        if let Some(interval) = env_u64("CHECK_MINING_RESULT_INTERVAL") {
            cfg.check_interval_secs = interval;
        }
        if let Some(window) = env_u64("POW_WINDOW_IN_SECONDS") {
            cfg.pow_window_secs = window as u32;
        }
        if let Some(devices) = env_u64("MINING_CPU_DEVICES") {
            cfg.cpu_devices = devices.max(1) as usize;
        }

        cfg
    }
}

/// Node-level configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Directory holding the state databases.
    pub db_path: PathBuf,
    /// Unix domain socket of the contract execution process.
    pub exec_socket: PathBuf,
    /// Proof-of-work settings.
    pub pow: PowConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./state"),
            exec_socket: PathBuf::from("/tmp/shardchain-exec.sock"),
            pow: PowConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Builds a configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(path) = env::var("STATE_DB_PATH") {
            cfg.db_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("EXEC_SOCKET_PATH") {
            cfg.exec_socket = PathBuf::from(path);
        }
        cfg.pow = PowConfig::from_env();
        cfg
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mode_is_light_cpu() {
        let cfg = PowConfig::default();
        assert_eq!(cfg.mode, MiningMode::LightCpu);
        assert!(cfg.check_interval_secs > 0);
    }

    #[test]
    fn default_node_config_paths() {
        let cfg = NodeConfig::default();
        assert!(!cfg.db_path.as_os_str().is_empty());
        assert!(!cfg.exec_socket.as_os_str().is_empty());
    }
}
