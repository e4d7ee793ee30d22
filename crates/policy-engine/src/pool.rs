//! Bounded pool of policy-loaded sandboxes.
//!
//! Contexts are created lazily up to `max_size`; once every context is busy,
//! `acquire` waits on a condition variable for at most the caller's bound.
//! A policy reload bumps the pool generation: idle contexts are dropped at
//! once, busy ones are reloaded the next time they are handed out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use rasp_core::config::PoolConfig;

use crate::error::{PoolError, ScriptError};
use crate::runtime::{Deadline, PolicyScript, Sandbox, SandboxFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Idle,
    Busy,
    Failed,
}

/// One sandbox with the policy loaded into it.
pub struct InterpreterContext {
    id: u64,
    sandbox: Box<dyn Sandbox>,
    generation: u64,
    state: ContextState,
    served: u64,
}

impl InterpreterContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of invocations served since creation.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn policy_id(&self) -> &str {
        self.sandbox.policy_id()
    }

    /// Runs the policy entry point. Interrupted or corrupted executions
    /// leave the context FAILED so the pool discards it on return.
    pub fn invoke(&mut self, entry: &str, input: &Value, deadline: &Deadline) -> Result<Value, ScriptError> {
        self.served += 1;
        let result = self.sandbox.invoke(entry, input, deadline);
        if matches!(result, Err(ScriptError::Interrupted) | Err(ScriptError::Corrupted(_)))
            || !self.sandbox.is_healthy()
        {
            self.state = ContextState::Failed;
        }
        result
    }

    fn reload(&mut self, script: &PolicyScript, generation: u64) -> Result<(), ScriptError> {
        self.sandbox.load(script)?;
        self.generation = generation;
        Ok(())
    }
}

impl std::fmt::Debug for InterpreterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpreterContext")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("served", &self.served)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size.max(1),
            idle_timeout: config.idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub generation: u64,
    pub created: u64,
    pub discarded: u64,
    pub exhausted: u64,
}

struct IdleContext {
    context: InterpreterContext,
    since: Instant,
}

struct PoolState {
    /// Oldest first; acquisition takes from the back.
    idle: Vec<IdleContext>,
    /// Idle, busy and reserved-for-creation contexts.
    total: usize,
    generation: u64,
    script: Arc<PolicyScript>,
    next_id: u64,
    closed: bool,
}

pub struct InterpreterPool {
    factory: Arc<dyn SandboxFactory>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
    created: AtomicU64,
    discarded: AtomicU64,
    exhausted: AtomicU64,
}

impl InterpreterPool {
    pub fn new(factory: Arc<dyn SandboxFactory>, script: PolicyScript, settings: PoolSettings) -> Self {
        Self {
            factory,
            settings,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                generation: 0,
                script: Arc::new(script),
                next_id: 0,
                closed: false,
            }),
            available: Condvar::new(),
            created: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Pre-creates `min_size` contexts (at least one).
    ///
    /// Failing to create the very first context means the sandbox runtime
    /// itself is unusable, which is reported as
    /// [`PoolError::SandboxUnavailable`].
    pub fn warm_up(&self) -> Result<usize, PoolError> {
        let target = self.settings.min_size.max(1).min(self.settings.max_size);
        let mut created = 0;
        loop {
            let (id, generation, script) = {
                let mut state = self.lock();
                if state.closed {
                    return Err(PoolError::ShutDown);
                }
                if state.total >= target {
                    break;
                }
                state.total += 1;
                state.next_id += 1;
                (state.next_id, state.generation, Arc::clone(&state.script))
            };

            match self.create_context(id, &script, generation) {
                Ok(context) => {
                    self.return_idle(context);
                    created += 1;
                }
                Err(err) => {
                    let total = self.free_slot();
                    if total == 0 {
                        return Err(PoolError::SandboxUnavailable(err.to_string()));
                    }
                    return Err(err);
                }
            }
        }
        tracing::debug!(created, "interpreter pool warmed up");
        Ok(created)
    }

    /// Borrows a context, waiting at most `wait` when the pool is saturated.
    pub fn acquire(&self, wait: Duration) -> Result<ContextLease<'_>, PoolError> {
        let started = Instant::now();
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(PoolError::ShutDown);
            }
            self.reap_idle(&mut state);

            if let Some(idle) = state.idle.pop() {
                let generation = state.generation;
                let script = Arc::clone(&state.script);
                drop(state);

                let mut context = idle.context;
                if context.generation != generation {
                    if let Err(err) = context.reload(&script, generation) {
                        tracing::warn!(context = context.id, error = %err, "reloading policy into context failed");
                        self.discard(context);
                        return Err(PoolError::ScriptLoad(err.to_string()));
                    }
                }
                context.state = ContextState::Busy;
                return Ok(ContextLease::new(self, context));
            }

            if state.total < self.settings.max_size {
                state.total += 1;
                state.next_id += 1;
                let id = state.next_id;
                let generation = state.generation;
                let script = Arc::clone(&state.script);
                drop(state);

                return match self.create_context(id, &script, generation) {
                    Ok(mut context) => {
                        context.state = ContextState::Busy;
                        Ok(ContextLease::new(self, context))
                    }
                    Err(err) => {
                        self.free_slot();
                        Err(err)
                    }
                };
            }

            let waited = started.elapsed();
            if waited >= wait {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Exhausted {
                    waited_ms: waited.as_millis(),
                });
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, wait - waited)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    /// Returns a context after use. FAILED or unhealthy contexts are
    /// discarded instead.
    pub fn release(&self, mut context: InterpreterContext) {
        if context.state == ContextState::Failed || !context.sandbox.is_healthy() {
            self.invalidate(context);
            return;
        }
        context.state = ContextState::Idle;
        self.return_idle(context);
    }

    /// Discards a context; its slot is refilled by the next acquisition
    /// that finds no idle context.
    pub fn invalidate(&self, mut context: InterpreterContext) {
        context.state = ContextState::Failed;
        tracing::warn!(
            context = context.id,
            served = context.served,
            "discarding failed interpreter context"
        );
        self.discard(context);
    }

    /// Swaps in a new policy script.
    ///
    /// The script is loaded into a fresh context first; if that fails the
    /// current script stays active.
    pub fn reload(&self, script: PolicyScript) -> Result<(), PoolError> {
        let probe_id = {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::ShutDown);
            }
            state.next_id += 1;
            state.next_id
        };
        let mut probe = self
            .factory
            .create()
            .map_err(|e| PoolError::SandboxUnavailable(e.to_string()))?;
        probe
            .load(&script)
            .map_err(|e| PoolError::ScriptLoad(e.to_string()))?;
        let (stale, parked) = {
            let mut state = self.lock();
            if state.closed {
                return Err(PoolError::ShutDown);
            }
            state.generation += 1;
            let generation = state.generation;
            state.script = Arc::new(script);
            let stale: Vec<IdleContext> = state.idle.drain(..).collect();
            state.total -= stale.len();
            let parked = state.total < self.settings.max_size;
            if parked {
                state.total += 1;
                state.idle.push(IdleContext {
                    context: InterpreterContext {
                        id: probe_id,
                        sandbox: probe,
                        generation,
                        state: ContextState::Idle,
                        served: 0,
                    },
                    since: Instant::now(),
                });
            }
            tracing::info!(
                generation,
                dropped = stale.len(),
                digest = %state.script.digest,
                "policy script reloaded"
            );
            (stale, parked)
        };
        if parked {
            self.created.fetch_add(1, Ordering::Relaxed);
        }
        self.discarded.fetch_add(stale.len() as u64, Ordering::Relaxed);
        drop(stale);
        self.available.notify_all();
        Ok(())
    }

    /// Drops idle contexts and refuses further acquisitions. Busy contexts
    /// are dropped when they come back.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            let drained: Vec<IdleContext> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        tracing::debug!(dropped = drained.len(), "interpreter pool shut down");
        drop(drained);
        self.available.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            busy: state.total - state.idle.len(),
            generation: state.generation,
            created: self.created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    pub fn script(&self) -> Arc<PolicyScript> {
        Arc::clone(&self.lock().script)
    }

    fn create_context(
        &self,
        id: u64,
        script: &PolicyScript,
        generation: u64,
    ) -> Result<InterpreterContext, PoolError> {
        let mut sandbox = self
            .factory
            .create()
            .map_err(|e| PoolError::ScriptLoad(e.to_string()))?;
        sandbox
            .load(script)
            .map_err(|e| PoolError::ScriptLoad(e.to_string()))?;
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(context = id, generation, "interpreter context created");
        Ok(InterpreterContext {
            id,
            sandbox,
            generation,
            state: ContextState::Idle,
            served: 0,
        })
    }

    fn return_idle(&self, context: InterpreterContext) {
        let mut state = self.lock();
        if state.closed {
            state.total -= 1;
            return;
        }
        state.idle.push(IdleContext {
            context,
            since: Instant::now(),
        });
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self, context: InterpreterContext) {
        drop(context);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.free_slot();
    }

    /// Releases one reserved slot and wakes a waiter; returns the new total.
    fn free_slot(&self) -> usize {
        let total = {
            let mut state = self.lock();
            state.total = state.total.saturating_sub(1);
            state.total
        };
        self.available.notify_one();
        total
    }

    fn reap_idle(&self, state: &mut PoolState) {
        while state.total > self.settings.min_size {
            match state.idle.first() {
                Some(oldest) if oldest.since.elapsed() >= self.settings.idle_timeout => {
                    let reaped = state.idle.remove(0);
                    state.total -= 1;
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(context = reaped.context.id, "reaped idle interpreter context");
                }
                _ => break,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A borrowed context. Dropping the lease returns it to the pool.
pub struct ContextLease<'a> {
    pool: &'a InterpreterPool,
    context: Option<InterpreterContext>,
}

impl std::fmt::Debug for ContextLease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("context", &self.context)
            .finish()
    }
}

impl<'a> ContextLease<'a> {
    fn new(pool: &'a InterpreterPool, context: InterpreterContext) -> Self {
        Self {
            pool,
            context: Some(context),
        }
    }

    pub fn context(&self) -> Option<&InterpreterContext> {
        self.context.as_ref()
    }

    pub fn invoke(&mut self, entry: &str, input: &Value, deadline: &Deadline) -> Result<Value, ScriptError> {
        match self.context.as_mut() {
            Some(context) => context.invoke(entry, input, deadline),
            None => Err(ScriptError::Corrupted("context already returned".to_string())),
        }
    }

    pub fn policy_id(&self) -> String {
        self.context
            .as_ref()
            .map(|context| context.policy_id().to_string())
            .unwrap_or_default()
    }

    pub fn release(mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }

    pub fn invalidate(mut self) {
        if let Some(context) = self.context.take() {
            self.pool.invalidate(context);
        }
    }
}

impl Drop for ContextLease<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}
