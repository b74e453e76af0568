//! PoW generation (multi-threaded CPU).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rayon::prelude::*;

use bpow_types::{WorkHash, WorkNonce};

use crate::validator::work_value;
use crate::WorkError;

/// Nonces tried per thread between checks of the stop flags.
const BATCH_SIZE: u64 = 4096;

/// Searches for work using every thread in the rayon pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkGenerator;

impl WorkGenerator {
    /// Find a nonce whose work value reaches `threshold`, starting at 0.
    pub fn generate(
        &self,
        hash: &WorkHash,
        threshold: u64,
        cancel: &AtomicBool,
    ) -> Result<WorkNonce, WorkError> {
        self.generate_from(0, hash, threshold, cancel)
    }

    /// Same as [`generate`](Self::generate) but begins the search at `start`,
    /// so independent machines do not walk the same nonces.
    ///
    /// Returns [`WorkError::Cancelled`] once `cancel` is observed set.
    pub fn generate_from(
        &self,
        start: u64,
        hash: &WorkHash,
        threshold: u64,
        cancel: &AtomicBool,
    ) -> Result<WorkNonce, WorkError> {
        if threshold == 0 {
            return Ok(WorkNonce(start));
        }

        let found = AtomicBool::new(false);
        let result = AtomicU64::new(0);
        let num_threads = rayon::current_num_threads().max(1) as u64;

        (0..num_threads).into_par_iter().for_each(|thread_id| {
            let stride = num_threads;
            let mut nonce = start.wrapping_add(thread_id);

            loop {
                if found.load(Ordering::Relaxed) || cancel.load(Ordering::Relaxed) {
                    return;
                }
                for _ in 0..BATCH_SIZE {
                    if work_value(hash, WorkNonce(nonce)) >= threshold {
                        // First finder wins; later finders drop their nonce.
                        if found
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                            .is_ok()
                        {
                            result.store(nonce, Ordering::Release);
                        }
                        return;
                    }
                    nonce = nonce.wrapping_add(stride);
                }
            }
        });

        if found.load(Ordering::Acquire) {
            Ok(WorkNonce(result.load(Ordering::Acquire)))
        } else {
            Err(WorkError::Cancelled)
        }
    }
}
