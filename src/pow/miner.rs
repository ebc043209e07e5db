//! The proof-of-work engine: header-hash derivation, nonce search, and
//! verification.
//!
//! Exactly one nonce search runs per `pow_mine` call; a dedicated mutex
//! serializes calls so a prior cancellation is fully observed before the
//! next search starts. All inner loops observe the stop flag every nonce;
//! device workers additionally coordinate through a condition variable.

use crate::config::{MiningMode, PowConfig};
use crate::crypto::key_pair::{PrivateKey, PublicKey};
use crate::pow::ethash::{EpochContext, FullContext, epoch};
use crate::pow::remote::RemoteMiner;
use crate::types::hash::Hash;
use crate::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Each device worker owns a nonce segment of width `2^40`.
const NONCE_SEGMENT_WIDTH: u32 = 40;
/// Nonces a device searches per `mine` invocation.
const DEVICE_BATCH: u64 = 512;

/// Outcome of one mining attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiningResult {
    /// Final hash of the winning nonce.
    pub result: Hash,
    /// Mix digest of the winning nonce.
    pub mix_hash: Hash,
    pub nonce: u64,
    /// `false` means the search was cancelled or exhausted.
    pub success: bool,
}

impl MiningResult {
    fn found(result: Hash, mix_hash: Hash, nonce: u64) -> Self {
        Self {
            result,
            mix_hash,
            nonce,
            success: true,
        }
    }

    fn failure() -> Self {
        Self {
            result: Hash::zero(),
            mix_hash: Hash::zero(),
            nonce: 0,
            success: false,
        }
    }
}

/// A solution candidate reported by a device worker.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSolution {
    pub nonce: u64,
    pub mix_hash: Hash,
}

/// A mining device searching nonce batches.
///
/// Implementations wrap whatever hardware is available; the engine fans out
/// one worker thread per device and re-verifies every candidate with the
/// light context before accepting it.
pub trait DeviceMiner: Send + Sync {
    fn name(&self) -> String;

    /// Searches `[start_nonce, start_nonce + batch)` for a candidate,
    /// observing `should_mine` at every nonce. `None` means batch exhausted
    /// or cancelled.
    fn mine(
        &self,
        ctx: &EpochContext,
        header: &Hash,
        boundary: &Hash,
        start_nonce: u64,
        batch: u64,
        should_mine: &AtomicBool,
    ) -> Option<DeviceSolution>;
}

/// CPU-backed device miner.
pub struct CpuDevice {
    id: usize,
}

impl CpuDevice {
    pub fn new(id: usize) -> Self {
        Self { id }
    }
}

impl DeviceMiner for CpuDevice {
    fn name(&self) -> String {
        format!("cpu-{}", self.id)
    }

    fn mine(
        &self,
        ctx: &EpochContext,
        header: &Hash,
        boundary: &Hash,
        start_nonce: u64,
        batch: u64,
        should_mine: &AtomicBool,
    ) -> Option<DeviceSolution> {
        let mut nonce = start_nonce;
        let end = start_nonce.saturating_add(batch);
        while nonce < end {
            if !should_mine.load(Ordering::Relaxed) {
                return None;
            }
            let result = ctx.hash(header, nonce);
            if result.final_hash.0 <= boundary.0 {
                return Some(DeviceSolution {
                    nonce,
                    mix_hash: result.mix_hash,
                });
            }
            nonce += 1;
        }
        None
    }
}

struct EpochState {
    current_block: u64,
    light: Option<Arc<EpochContext>>,
    full: Option<Arc<FullContext>>,
}

struct DeviceResults {
    results: Vec<MiningResult>,
    finished: usize,
}

/// Process-wide proof-of-work engine.
pub struct PowEngine {
    config: PowConfig,
    epoch_state: Mutex<EpochState>,
    should_mine: AtomicBool,
    mine_lock: Mutex<()>,
    device_results: Mutex<DeviceResults>,
    results_cv: Condvar,
    devices: Vec<Arc<dyn DeviceMiner>>,
    remote: Option<RemoteMiner>,
}

impl PowEngine {
    pub fn new(config: PowConfig) -> Self {
        let devices: Vec<Arc<dyn DeviceMiner>> = (0..config.cpu_devices)
            .map(|id| Arc::new(CpuDevice::new(id)) as Arc<dyn DeviceMiner>)
            .collect();
        let remote = match config.mode {
            MiningMode::Remote => Some(RemoteMiner::new(config.proxy_url.clone())),
            _ => None,
        };
        Self {
            config,
            epoch_state: Mutex::new(EpochState {
                current_block: 0,
                light: None,
                full: None,
            }),
            should_mine: AtomicBool::new(false),
            mine_lock: Mutex::new(()),
            device_results: Mutex::new(DeviceResults {
                results: Vec::new(),
                finished: 0,
            }),
            results_cv: Condvar::new(),
            devices,
            remote,
        }
    }

    // ==================== Pure helpers ====================

    /// Expands a difficulty level into its 256-bit boundary.
    ///
    /// The first `d/8` bytes are zero, the next byte takes its value from a
    /// fixed mask table indexed by `d mod 8`, and the remainder is `0xFF`.
    pub fn difficulty_to_boundary(difficulty: u8) -> Hash {
        const MASKS: [u8; 8] = [0xFF, 0x7F, 0x3F, 0x1F, 0x0F, 0x07, 0x03, 0x01];

        let mut boundary = [0xFFu8; 32];
        let zero_bytes = (difficulty / 8) as usize;
        for byte in boundary.iter_mut().take(zero_bytes) {
            *byte = 0;
        }
        boundary[zero_bytes] = MASKS[(difficulty % 8) as usize];
        Hash(boundary)
    }

    /// Byte-wise big-endian comparison against the boundary.
    pub fn check_difficulty(result: &Hash, boundary: &Hash) -> bool {
        result.0 <= boundary.0
    }

    /// Checks a candidate hash against a difficulty level.
    pub fn check_soln_against_difficulty(result: &Hash, difficulty: u8) -> bool {
        Self::check_difficulty(result, &Self::difficulty_to_boundary(difficulty))
    }

    /// Deterministic ethash header input.
    ///
    /// `SHA256(rand1 || rand2 || ip || pubkey || lookup_id || gas_price)`
    /// with integers big-endian fixed-width.
    pub fn gen_header_hash(
        rand1: &[u8; 32],
        rand2: &[u8; 32],
        ip: u128,
        pubkey: &PublicKey,
        lookup_id: u32,
        gas_price: u128,
    ) -> Hash {
        let mut h = Hash::sha256();
        h.update(rand1);
        h.update(rand2);
        h.update(&ip.to_be_bytes());
        h.update(&pubkey.to_bytes());
        h.update(&lookup_id.to_be_bytes());
        h.update(&gas_price.to_be_bytes());
        h.finalize()
    }

    // ==================== Context management ====================

    /// Ensures the light (and, if requested, full) context matches the
    /// epoch of `block_num`. Recomputed only when the epoch changes.
    pub fn ethash_configure_client(&self, block_num: u64, full_dataset: bool) {
        let mut state = self.epoch_state.lock().unwrap_or_else(|e| e.into_inner());

        if block_num < state.current_block {
            warn!(
                "latest block number {} is smaller than current block number {}",
                block_num, state.current_block
            );
        }

        let target_epoch = epoch(block_num);
        let stale = state
            .light
            .as_ref()
            .map(|ctx| ctx.epoch() != target_epoch)
            .unwrap_or(true);
        if stale {
            state.light = Some(Arc::new(EpochContext::new(block_num)));
        }

        if full_dataset {
            let full_stale = state
                .full
                .as_ref()
                .map(|ctx| ctx.epoch() != target_epoch)
                .unwrap_or(true);
            if full_stale {
                state.full = Some(Arc::new(FullContext::new(block_num)));
            }
        }

        state.current_block = block_num;
    }

    fn light_context(&self) -> Arc<EpochContext> {
        self.epoch_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .light
            .clone()
            .expect("light context configured before use")
    }

    fn full_context(&self) -> Arc<FullContext> {
        self.epoch_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .full
            .clone()
            .expect("full context configured before use")
    }

    // ==================== Mining ====================

    /// Requests cancellation; every search loop observes it at its next
    /// nonce or poll interval.
    pub fn stop_mining(&self) {
        self.should_mine.store(false, Ordering::SeqCst);
        self.results_cv.notify_all();
    }

    /// Runs one nonce search for `(block_num, difficulty, header_hash)`.
    ///
    /// The mode comes from configuration: light CPU, full-dataset CPU,
    /// device fan-out, or the remote proxy. Exactly one search runs at a
    /// time; the caller's key pair is only used by the remote path.
    pub fn pow_mine(
        &self,
        block_num: u64,
        difficulty: u8,
        key: &PrivateKey,
        header_hash: &Hash,
        full_dataset: bool,
        start_nonce: u64,
    ) -> MiningResult {
        // Serializes searches so a previous cancellation is fully processed
        // before the next search begins.
        let _guard = self.mine_lock.lock().unwrap_or_else(|e| e.into_inner());

        let want_full = full_dataset || self.config.mode == MiningMode::FullCpu;
        let use_full = want_full && self.config.mode != MiningMode::Devices;
        self.ethash_configure_client(block_num, use_full);
        let boundary = Self::difficulty_to_boundary(difficulty);

        self.should_mine.store(true, Ordering::SeqCst);

        match self.config.mode {
            MiningMode::Remote => self.remote_mine(key, block_num, header_hash, &boundary),
            MiningMode::Devices => self.mine_with_devices(header_hash, &boundary, start_nonce),
            _ if use_full => self.mine_full(header_hash, &boundary, start_nonce),
            _ => self.mine_light(header_hash, &boundary, start_nonce),
        }
    }

    fn mine_light(&self, header: &Hash, boundary: &Hash, start_nonce: u64) -> MiningResult {
        let ctx = self.light_context();
        let mut nonce = start_nonce;
        while self.should_mine.load(Ordering::Relaxed) {
            let result = ctx.hash(header, nonce);
            if result.final_hash.0 <= boundary.0 {
                return MiningResult::found(result.final_hash, result.mix_hash, nonce);
            }
            nonce = nonce.wrapping_add(1);
        }
        MiningResult::failure()
    }

    fn mine_full(&self, header: &Hash, boundary: &Hash, start_nonce: u64) -> MiningResult {
        let ctx = self.full_context();
        let mut nonce = start_nonce;
        while self.should_mine.load(Ordering::Relaxed) {
            let result = ctx.hash(header, nonce);
            if result.final_hash.0 <= boundary.0 {
                return MiningResult::found(result.final_hash, result.mix_hash, nonce);
            }
            nonce = nonce.wrapping_add(1);
        }
        MiningResult::failure()
    }

    /// Fans the search out across all configured devices.
    ///
    /// Worker `i` owns the nonce segment starting at
    /// `start_nonce + i * 2^40`. The first verified hit wakes the engine
    /// and cancels its peers; every candidate is re-verified with the light
    /// context before being reported.
    fn mine_with_devices(&self, header: &Hash, boundary: &Hash, start_nonce: u64) -> MiningResult {
        let ctx = self.light_context();

        {
            let mut results = self
                .device_results
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            results.results = vec![MiningResult::failure(); self.devices.len()];
            results.finished = 0;
        }

        thread::scope(|scope| {
            for (index, device) in self.devices.iter().enumerate() {
                let ctx = Arc::clone(&ctx);
                let device = Arc::clone(device);
                scope.spawn(move || {
                    self.device_worker(index, device, &ctx, header, boundary, start_nonce);
                });
            }

            let mut results = self
                .device_results
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            while !results.results.iter().any(|r| r.success)
                && results.finished < self.devices.len()
            {
                results = self
                    .results_cv
                    .wait(results)
                    .unwrap_or_else(|e| e.into_inner());
            }
            // Cancel peers and release the results lock before the scope
            // joins them; finishing workers still need to record failures.
            self.should_mine.store(false, Ordering::SeqCst);
            drop(results);
        });

        let results = self
            .device_results
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        results
            .results
            .iter()
            .find(|r| r.success)
            .cloned()
            .unwrap_or_else(MiningResult::failure)
    }

    fn device_worker(
        &self,
        index: usize,
        device: Arc<dyn DeviceMiner>,
        ctx: &EpochContext,
        header: &Hash,
        boundary: &Hash,
        start_nonce: u64,
    ) {
        let mut nonce = start_nonce.wrapping_add((index as u64) << NONCE_SEGMENT_WIDTH);

        let outcome = loop {
            if !self.should_mine.load(Ordering::Relaxed) {
                break MiningResult::failure();
            }
            match device.mine(ctx, header, boundary, nonce, DEVICE_BATCH, &self.should_mine) {
                Some(solution) => {
                    // Re-verify with the light context before reporting.
                    let check = ctx.hash(header, solution.nonce);
                    if check.final_hash.0 <= boundary.0 {
                        break MiningResult::found(
                            check.final_hash,
                            check.mix_hash,
                            solution.nonce,
                        );
                    }
                    warn!(
                        "device {} produced an invalid solution at nonce {}",
                        device.name(),
                        solution.nonce
                    );
                    nonce = solution.nonce.wrapping_add(1);
                }
                None => {
                    nonce = nonce.wrapping_add(DEVICE_BATCH);
                }
            }
        };

        let mut results = self
            .device_results
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        results.results[index] = outcome;
        results.finished += 1;
        self.results_cv.notify_all();
    }

    // ==================== Remote mining ====================

    fn remote_mine(
        &self,
        key: &PrivateKey,
        block_num: u64,
        header: &Hash,
        boundary: &Hash,
    ) -> MiningResult {
        let Some(remote) = &self.remote else {
            warn!("remote mining requested without a configured proxy");
            return MiningResult::failure();
        };

        match remote.request_work(key, block_num, header, boundary, self.config.pow_window_secs) {
            Ok(true) => {}
            Ok(false) => {
                warn!("mining proxy rejected the work package");
                return MiningResult::failure();
            }
            Err(e) => {
                warn!("failed to send work package to mining proxy: {e}");
                return MiningResult::failure();
            }
        }

        let mut mining_result = MiningResult::failure();
        let verified = self.poll_remote_result(remote, key, header, boundary, &mut mining_result);
        if !verified {
            warn!("failed to verify pow result from mining proxy");
        }
        if let Err(e) = remote.verify_result(key, verified, header, boundary) {
            warn!("failed to send verify result to mining proxy: {e}");
        }

        mining_result
    }

    /// Polls the proxy until the work is done, cancelled, or errored.
    /// Returns whether a locally verified solution was obtained.
    fn poll_remote_result(
        &self,
        remote: &RemoteMiner,
        key: &PrivateKey,
        header: &Hash,
        boundary: &Hash,
        mining_result: &mut MiningResult,
    ) -> bool {
        while self.should_mine.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(self.config.check_interval_secs));

            let status = match remote.check_work_status(key, header, boundary) {
                Ok(status) => status,
                Err(e) => {
                    warn!("zil_checkWorkStatus failed: {e}");
                    return false;
                }
            };
            if !status.done {
                continue;
            }

            let ctx = self.light_context();
            let check = ctx.hash(&status.header, status.nonce);
            if check.final_hash.0 > boundary.0
                || !ctx.verify(&status.header, &status.mix_hash, status.nonce, boundary)
            {
                warn!("failed to verify pow result from proxy");
                return false;
            }

            *mining_result =
                MiningResult::found(check.final_hash, status.mix_hash, status.nonce);
            return true;
        }
        false
    }

    // ==================== Verification ====================

    /// Verifies a claimed solution for `(block_num, difficulty)`.
    pub fn pow_verify(
        &self,
        block_num: u64,
        difficulty: u8,
        header: &Hash,
        nonce: u64,
        result: &Hash,
        mix_hash: &Hash,
    ) -> bool {
        self.ethash_configure_client(block_num, false);
        let boundary = Self::difficulty_to_boundary(difficulty);

        if result.0 > boundary.0 {
            warn!("pow solution does not meet the difficulty requirement");
            return false;
        }
        self.light_context().verify(header, mix_hash, nonce, &boundary)
    }
}
