//! Collective communication between workers.
//!
//! Every worker of a run holds one [`Collective`] endpoint.  All exchanges are
//! blocking and must be entered by every worker in the same order; a worker
//! that skips one leaves the others waiting.  The single primitive is
//! [`Collective::all_gather`]; reductions, broadcast and the info dict are
//! built on top of it and combine contributions in rank order, so every worker
//! gets bit-identical results.
//!
//! Two transports are provided: [`SoloComm`] for single-worker runs and
//! [`ThreadWorld`], which connects workers running as threads in one process.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CommError;

/// Blocking collective operations over a fixed set of workers.
pub trait Collective {
    /// This worker's rank, `0..size`.
    fn rank(&self) -> usize;

    /// Number of workers.
    fn size(&self) -> usize;

    /// Every worker contributes `value`; every worker receives all
    /// contributions in rank order.
    fn all_gather<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>, CommError>;

    /// Whether this is rank 0.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Wait until every worker reaches this point.
    fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(&()).map(|_| ())
    }

    /// Global sum of a scalar.
    fn all_sum(&self, value: f64) -> Result<f64, CommError> {
        Ok(self.all_gather(&value)?.into_iter().sum())
    }

    /// Global minimum of a scalar.
    fn all_min(&self, value: f64) -> Result<f64, CommError> {
        Ok(self.all_gather(&value)?.into_iter().fold(f64::INFINITY, f64::min))
    }

    /// Global maximum of a scalar.
    fn all_max(&self, value: f64) -> Result<f64, CommError> {
        Ok(self.all_gather(&value)?.into_iter().fold(f64::NEG_INFINITY, f64::max))
    }

    /// Element-wise global sum, in place.
    fn all_sum_slice(&self, values: &mut [f64]) -> Result<(), CommError> {
        let parts = self.all_gather(&values.to_vec())?;
        combine_into(values, &parts, 0.0, |a, b| a + b)
    }

    /// Element-wise global minimum, in place.
    fn all_min_slice(&self, values: &mut [f64]) -> Result<(), CommError> {
        let parts = self.all_gather(&values.to_vec())?;
        combine_into(values, &parts, f64::INFINITY, f64::min)
    }

    /// Element-wise global maximum, in place.
    fn all_max_slice(&self, values: &mut [f64]) -> Result<(), CommError> {
        let parts = self.all_gather(&values.to_vec())?;
        combine_into(values, &parts, f64::NEG_INFINITY, f64::max)
    }

    /// Element-wise global sum of counts, in place.
    fn all_sum_counts(&self, values: &mut [u64]) -> Result<(), CommError> {
        let parts = self.all_gather(&values.to_vec())?;
        combine_into(values, &parts, 0, |a, b| a + b)
    }

    /// Send `value` from `root` to every worker.
    ///
    /// Only the root's argument is used; other workers may pass `None`.
    fn broadcast<T: Serialize + DeserializeOwned>(&self, root: usize, value: Option<T>) -> Result<T, CommError> {
        if root >= self.size() {
            return Err(CommError::BadRoot {
                root,
                size: self.size(),
            });
        }
        let contribution = if self.rank() == root { value } else { None };
        self.all_gather(&contribution)?
            .into_iter()
            .nth(root)
            .flatten()
            .ok_or(CommError::Missing { rank: root })
    }

    /// Concatenate every worker's array in rank order.
    fn gather_concat<T: Serialize + DeserializeOwned>(&self, values: Vec<T>) -> Result<Vec<T>, CommError> {
        Ok(self.all_gather(&values)?.into_iter().flatten().collect())
    }

    /// Every worker contributes one value; every worker receives the rank -> value map.
    fn info_dict<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<BTreeMap<usize, T>, CommError> {
        Ok(self.all_gather(value)?.into_iter().enumerate().collect())
    }

    /// Collective exit decision: `true` on every worker if any worker asks to exit.
    fn exit_test(&self, should_exit: bool) -> Result<bool, CommError> {
        Ok(self.all_gather(&should_exit)?.into_iter().any(|b| b))
    }
}

/// Fold rank-ordered contributions element-wise into `values`.
fn combine_into<T: Copy>(
    values: &mut [T],
    parts: &[Vec<T>],
    identity: T,
    op: impl Fn(T, T) -> T,
) -> Result<(), CommError> {
    for (rank, part) in parts.iter().enumerate() {
        if part.len() != values.len() {
            return Err(CommError::LengthMismatch {
                expected: values.len(),
                found: part.len(),
                rank,
            });
        }
    }
    for (i, v) in values.iter_mut().enumerate() {
        *v = parts.iter().fold(identity, |acc, part| op(acc, part[i]));
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CommError> {
    bincode::serialize(value).map_err(|e| CommError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CommError> {
    bincode::deserialize(bytes).map_err(|e| CommError::Encode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Single worker
// ---------------------------------------------------------------------------

/// The only worker of a one-worker run.
///
/// Payloads still pass through the encoder so serialization failures show up
/// the same way they would with more workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloComm;

impl Collective for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>, CommError> {
        Ok(vec![decode(&encode(value)?)?])
    }
}

// ---------------------------------------------------------------------------
// Threads in one process
// ---------------------------------------------------------------------------

/// Exchange area shared by all endpoints of one world.
struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

/// Factory for a set of connected thread endpoints.
pub struct ThreadWorld;

impl ThreadWorld {
    /// Create `size` connected endpoints, one per worker thread.
    pub fn create(size: usize) -> Vec<ThreadComm> {
        let size = size.max(1);
        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![None; size]),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }
}

/// One worker's endpoint in a [`ThreadWorld`].
pub struct ThreadComm {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

impl Collective for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>, CommError> {
        // Encoding failures are reported after the exchange so that no worker
        // leaves the others stranded at the barrier.
        let encoded = encode(value);
        {
            let mut slots = self.exchange.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots[self.rank] = encoded.as_ref().ok().cloned();
        }
        self.exchange.barrier.wait();
        let gathered: Vec<Option<Vec<u8>>> = self
            .exchange
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        // Second rendezvous: nobody overwrites a slot before everyone has read it.
        self.exchange.barrier.wait();

        encoded?;
        gathered
            .into_iter()
            .enumerate()
            .map(|(rank, slot)| {
                let bytes = slot.ok_or(CommError::Missing { rank })?;
                decode(&bytes)
            })
            .collect()
    }
}
