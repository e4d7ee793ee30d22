//! Coalesces concurrent cache misses on the same key into one execution.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::decision::Decision;
use crate::error::CheckError;

type FlightResult = Result<Arc<Decision>, CheckError>;

#[derive(Default)]
struct Slot {
    result: Mutex<Option<FlightResult>>,
    done: Condvar,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<FlightResult>> {
        self.result.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
pub struct InflightTable {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

pub enum Flight<'a> {
    /// First caller for the key; must run the policy and complete the guard.
    Leader(LeaderGuard<'a>),
    /// Another caller is already executing this key.
    Follower(Follower),
}

impl InflightTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &str) -> Flight<'_> {
        let mut slots = self.lock();
        if let Some(slot) = slots.get(key) {
            return Flight::Follower(Follower {
                slot: Arc::clone(slot),
            });
        }
        let slot = Arc::new(Slot::default());
        slots.insert(key.to_string(), Arc::clone(&slot));
        Flight::Leader(LeaderGuard {
            table: self,
            key: key.to_string(),
            slot,
            completed: false,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn finish(&self, key: &str, slot: &Slot, result: FlightResult) {
        self.lock().remove(key);
        *slot.lock() = Some(result);
        slot.done.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct LeaderGuard<'a> {
    table: &'a InflightTable,
    key: String,
    slot: Arc<Slot>,
    completed: bool,
}

impl LeaderGuard<'_> {
    pub fn complete(mut self, result: FlightResult) {
        self.completed = true;
        self.table.finish(&self.key, &self.slot, result);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.table.finish(
                &self.key,
                &self.slot,
                Err(CheckError::ScriptRuntime("coalesced check abandoned".to_string())),
            );
        }
    }
}

pub struct Follower {
    slot: Arc<Slot>,
}

impl Follower {
    /// Waits for the leader's result, bounded by `timeout`.
    pub fn wait(self, timeout: Duration) -> FlightResult {
        let started = Instant::now();
        let mut result = self.slot.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(CheckError::CheckTimeout(format!(
                    "waited {}ms for coalesced check",
                    waited.as_millis()
                )));
            }
            let (guard, _) = self
                .slot
                .done
                .wait_timeout(result, timeout - waited)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            result = guard;
        }
    }
}
