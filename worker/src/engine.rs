//! Compute engines.
//!
//! Anything that can search for a nonce implements [`WorkEngine`]. The CPU
//! engine is always available; other backends plug in behind the same trait
//! and are raced by an [`EnginePool`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use bpow_types::{WorkHash, WorkNonce};
use bpow_work::{WorkError, WorkGenerator};

use crate::WorkerError;

/// How often a race checks the caller's cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(5);

pub trait WorkEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Search for a nonce meeting `threshold`. Must return
    /// [`WorkError::Cancelled`] promptly once `cancel` is set, if it honours
    /// the flag at all.
    fn generate(
        &self,
        hash: &WorkHash,
        threshold: u64,
        cancel: &AtomicBool,
    ) -> Result<WorkNonce, WorkError>;
}

/// Multi-threaded CPU search starting at a random nonce.
pub struct CpuEngine {
    generator: WorkGenerator,
    pool: Option<rayon::ThreadPool>,
}

impl CpuEngine {
    /// `threads = None` shares rayon's global pool.
    pub fn new(threads: Option<usize>) -> Result<Self, WorkerError> {
        let pool = match threads {
            Some(n) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("bpow-cpu-{i}"))
                    .build()
                    .map_err(|e| WorkerError::Engine(e.to_string()))?,
            ),
            None => None,
        };
        Ok(Self {
            generator: WorkGenerator,
            pool,
        })
    }

    pub fn threads(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }
}

impl WorkEngine for CpuEngine {
    fn name(&self) -> &str {
        "cpu"
    }

    fn generate(
        &self,
        hash: &WorkHash,
        threshold: u64,
        cancel: &AtomicBool,
    ) -> Result<WorkNonce, WorkError> {
        let start: u64 = rand::thread_rng().gen();
        let search = || self.generator.generate_from(start, hash, threshold, cancel);
        match &self.pool {
            Some(pool) => pool.install(search),
            None => search(),
        }
    }
}

/// Races several engines; the first nonce wins and stops the others.
pub struct EnginePool {
    engines: Vec<Arc<dyn WorkEngine>>,
}

impl EnginePool {
    pub fn new(engines: Vec<Arc<dyn WorkEngine>>) -> Result<Self, WorkerError> {
        if engines.is_empty() {
            return Err(WorkerError::Engine("no compute engine available".into()));
        }
        Ok(Self { engines })
    }

    /// A pool holding only the CPU engine.
    pub fn cpu(threads: Option<usize>) -> Result<Self, WorkerError> {
        Self::new(vec![Arc::new(CpuEngine::new(threads)?)])
    }

    pub fn names(&self) -> Vec<&str> {
        self.engines.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    fn race(
        &self,
        hash: &WorkHash,
        threshold: u64,
        cancel: &AtomicBool,
    ) -> Result<WorkNonce, WorkError> {
        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for engine in &self.engines {
                let tx = tx.clone();
                let stop = &stop;
                scope.spawn(move || {
                    let outcome = engine.generate(hash, threshold, stop);
                    if let Err(e) = &outcome {
                        debug!(engine = engine.name(), error = %e, "engine gave up");
                    }
                    let _ = tx.send(outcome);
                });
            }
            drop(tx);

            // Forward the caller's cancellation into the race.
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    if cancel.load(Ordering::Relaxed) {
                        stop.store(true, Ordering::Relaxed);
                        return;
                    }
                    thread::sleep(CANCEL_POLL);
                }
            });

            let mut failure = WorkError::Cancelled;
            let mut winner = None;
            for outcome in rx.iter() {
                match outcome {
                    Ok(nonce) => {
                        winner = Some(nonce);
                        break;
                    }
                    Err(e) => failure = e,
                }
            }
            stop.store(true, Ordering::Relaxed);
            winner.ok_or(failure)
        })
    }
}

impl WorkEngine for EnginePool {
    fn name(&self) -> &str {
        "pool"
    }

    fn generate(
        &self,
        hash: &WorkHash,
        threshold: u64,
        cancel: &AtomicBool,
    ) -> Result<WorkNonce, WorkError> {
        match self.engines.as_slice() {
            [only] => only.generate(hash, threshold, cancel),
            _ => self.race(hash, threshold, cancel),
        }
    }
}
