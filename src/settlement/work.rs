use async_trait::async_trait;
use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use dashmap::DashMap;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::rpc::{NodeRpc, RpcError};
use super::storage::{Keyspace, OptionalExt, Storage, StorageError};

/// Threshold for send and change blocks
pub const SEND_DIFFICULTY: &str = "fffffff800000000";

/// Lower threshold accepted for receive and open blocks
pub const RECEIVE_DIFFICULTY: &str = "fffffe0000000000";

/// Nonces tried between checks of the stop flag
const CPU_BATCH: u32 = 4096;

#[derive(Debug, Error)]
pub enum WorkError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("RPC error: {0}")]
    RpcError(#[from] RpcError),

    #[error("Invalid difficulty: {0}")]
    InvalidDifficulty(String),

    #[error("Invalid root hash: {0}")]
    InvalidRoot(String),

    #[error("Work {work} does not meet difficulty {difficulty} for {hash}")]
    InvalidWork { hash: String, work: String, difficulty: String },

    #[error("Local work generation stopped without a result for {0}")]
    Interrupted(String),

    #[error("Unable to generate work for {hash} at difficulty {difficulty}")]
    Exhausted { hash: String, difficulty: String },
}

/// Proof of work for one root hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    pub hash: String,
    pub work: String,
    pub difficulty: String,
    pub multiplier: String,
}

fn parse_difficulty(difficulty: &str) -> Result<u64, WorkError> {
    u64::from_str_radix(difficulty, 16).map_err(|_| WorkError::InvalidDifficulty(difficulty.to_string()))
}

fn parse_root(hash: &str) -> Result<[u8; 32], WorkError> {
    hex::decode(hash)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| WorkError::InvalidRoot(hash.to_string()))
}

/// The value the node compares against the difficulty threshold
pub fn work_value(root: &[u8; 32], work: u64) -> u64 {
    let mut hasher = Blake2b::<U8>::new();
    hasher.update(work.to_le_bytes());
    hasher.update(root);
    let digest: [u8; 8] = hasher.finalize().into();
    u64::from_le_bytes(digest)
}

/// Checks `work` for `hash` against `difficulty`
pub fn validate_work(hash: &str, work: &str, difficulty: &str) -> Result<bool, WorkError> {
    let root = parse_root(hash)?;
    let threshold = parse_difficulty(difficulty)?;
    let nonce = match u64::from_str_radix(work, 16) {
        Ok(nonce) => nonce,
        Err(_) => return Ok(false),
    };
    Ok(work_value(&root, nonce) >= threshold)
}

/// Persistent `hash -> work` map. Entries never expire.
#[derive(Debug, Clone)]
pub struct WorkCache {
    storage: Arc<Storage>,
}

impl WorkCache {
    pub fn new(storage: Arc<Storage>) -> Self {
        WorkCache { storage }
    }

    pub fn get(&self, hash: &str) -> Result<Option<WorkResult>, StorageError> {
        self.storage.get(Keyspace::WorkCache, hash).optional()
    }

    pub fn put(&self, hash: &str, work: &WorkResult) -> Result<(), StorageError> {
        self.storage.put(Keyspace::WorkCache, hash, work)
    }

    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .storage
            .entries::<WorkResult>(Keyspace::WorkCache)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
}

/// One source of proof of work
#[async_trait]
pub trait WorkGenerator: Send + Sync {
    async fn generate(&self, hash: &str, difficulty: &str) -> Result<WorkResult, WorkError>;

    fn name(&self) -> String;
}

/// Asks a remote node's `work_generate`, rejecting answers that do not validate
pub struct RemoteWorkGenerator {
    rpc: Arc<dyn NodeRpc>,
}

impl RemoteWorkGenerator {
    pub fn new(rpc: Arc<dyn NodeRpc>) -> Self {
        RemoteWorkGenerator { rpc }
    }
}

#[async_trait]
impl WorkGenerator for RemoteWorkGenerator {
    async fn generate(&self, hash: &str, difficulty: &str) -> Result<WorkResult, WorkError> {
        info!("RPC work_generate: {} {} {}", hash, difficulty, self.rpc.endpoint());
        let result = self.rpc.work_generate(hash, difficulty).await?;

        if !validate_work(hash, &result.work, difficulty)? {
            return Err(WorkError::InvalidWork {
                hash: hash.to_string(),
                work: result.work,
                difficulty: difficulty.to_string(),
            });
        }

        info!("RPC work_generate result: {} {}", hash, result.work);
        Ok(result)
    }

    fn name(&self) -> String {
        format!("rpc:{}", self.rpc.endpoint())
    }
}

/// Sets the flag when dropped, so abandoned searches stop their workers
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Brute-forces work on blocking threads. Always available, slowest.
pub struct CpuWorkGenerator {
    workers: usize,
}

impl CpuWorkGenerator {
    pub fn new(workers: usize) -> Self {
        CpuWorkGenerator { workers: workers.max(1) }
    }
}

impl Default for CpuWorkGenerator {
    fn default() -> Self {
        let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self::new(workers)
    }
}

#[async_trait]
impl WorkGenerator for CpuWorkGenerator {
    async fn generate(&self, hash: &str, difficulty: &str) -> Result<WorkResult, WorkError> {
        let root = parse_root(hash)?;
        let threshold = parse_difficulty(difficulty)?;
        info!("CPU work_generate: {} {} on {} workers", hash, difficulty, self.workers);

        let stop = Arc::new(AtomicBool::new(false));
        let _stop_guard = StopOnDrop(stop.clone());
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u64>(1);

        for _ in 0..self.workers {
            let stop = stop.clone();
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || {
                let mut nonce: u64 = rand::random();
                while !stop.load(Ordering::Relaxed) {
                    for _ in 0..CPU_BATCH {
                        if work_value(&root, nonce) >= threshold {
                            stop.store(true, Ordering::Relaxed);
                            let _ = tx.try_send(nonce);
                            return;
                        }
                        nonce = nonce.wrapping_add(1);
                    }
                }
            });
        }
        drop(tx);

        let nonce = rx
            .recv()
            .await
            .ok_or_else(|| WorkError::Interrupted(hash.to_string()))?;
        let work = format!("{:016x}", nonce);
        info!("CPU work_generate result: {} {}", hash, work);

        Ok(WorkResult {
            hash: hash.to_string(),
            work,
            difficulty: difficulty.to_string(),
            multiplier: String::new(),
        })
    }

    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Produces proof of work, deduplicated through the cache and a per-hash lock
pub struct WorkService {
    cache: WorkCache,
    remotes: Vec<Arc<dyn WorkGenerator>>,
    local: Arc<dyn WorkGenerator>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WorkService {
    /// # Arguments
    ///
    /// * `cache` - The work cache
    /// * `remotes` - Remote generators, tried in random order
    /// * `local` - The fallback tried after every remote
    pub fn new(cache: WorkCache, remotes: Vec<Arc<dyn WorkGenerator>>, local: Arc<dyn WorkGenerator>) -> Self {
        WorkService {
            cache,
            remotes,
            local,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, hash: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Returns cached work for `hash`, or generates it
    ///
    /// Concurrent callers for the same hash wait for a single generation.
    /// Work at the send difficulty is cached, since it satisfies every block type.
    pub async fn generate_work(&self, hash: &str, difficulty: Option<&str>) -> Result<WorkResult, WorkError> {
        let hash = hash.to_uppercase();
        let difficulty = difficulty.unwrap_or(SEND_DIFFICULTY);

        let lock = self.lock_for(&hash);
        let _guard = lock.lock().await;

        if let Some(cached) = self.cache.get(&hash)? {
            return Ok(cached);
        }

        let result = self.work_generate(&hash, Some(difficulty)).await?;
        if difficulty == SEND_DIFFICULTY {
            self.cache.put(&hash, &result)?;
        }
        Ok(result)
    }

    /// Tries every generator in turn: remotes shuffled, then the local one
    pub async fn work_generate(&self, hash: &str, difficulty: Option<&str>) -> Result<WorkResult, WorkError> {
        let difficulty = difficulty.unwrap_or(SEND_DIFFICULTY);

        let mut generators = self.remotes.clone();
        generators.shuffle(&mut rand::thread_rng());
        generators.push(self.local.clone());

        for generator in generators {
            match generator.generate(hash, difficulty).await {
                Ok(result) => return Ok(result),
                Err(err) => error!("Work generator {} failed for {}: {}", generator.name(), hash, err),
            }
        }

        Err(WorkError::Exhausted {
            hash: hash.to_string(),
            difficulty: difficulty.to_string(),
        })
    }

    /// Pre-computes work for a future frontier. Failures are only logged.
    pub async fn generate_and_cache_work(&self, hash: &str) {
        let hash = hash.to_uppercase();
        let lock = self.lock_for(&hash);
        let _guard = lock.lock().await;

        let outcome = async {
            if self.cache.get(&hash)?.is_none() {
                let result = self.work_generate(&hash, Some(SEND_DIFFICULTY)).await?;
                self.cache.put(&hash, &result)?;
                info!("Cached work for {}: {}", hash, result.work);
            }
            Ok::<(), WorkError>(())
        }
        .await;

        if let Err(err) = outcome {
            warn!("generate_and_cache_work failed for {}: {}", hash, err);
        }
    }

    pub fn cache(&self) -> &WorkCache {
        &self.cache
    }
}
