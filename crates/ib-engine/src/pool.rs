//! A fixed set of backend instances shared between threads.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::error::{EngineError, Result};
use crate::interface::InferenceBackend;
use crate::setup::setup_inference_engine;

type Backend = Box<dyn InferenceBackend>;

/// Builds a fresh instance to stand in for a retired one.
pub type BackendFactory = Box<dyn Fn() -> Result<Backend> + Send + Sync>;

struct PoolState {
    idle: Vec<Backend>,
    /// Instances idle or checked out; retired instances are not counted.
    live: usize,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    size: usize,
    factory: Option<BackendFactory>,
}

impl PoolInner {
    /// Take an unusable instance out of service, replacing it when a
    /// factory is available.
    fn retire(&self, backend: Backend) {
        warn!(backend = backend.name(), "retiring unusable backend from pool");
        drop(backend);

        let replacement = self.factory.as_ref().and_then(|factory| match factory() {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                error!(error = %e, "failed to rebuild pooled backend");
                None
            }
        });

        let mut state = self.state.lock();
        match replacement {
            Some(fresh) => {
                info!(backend = fresh.name(), "replaced retired backend");
                state.idle.push(fresh);
                self.available.notify_one();
            }
            None => {
                state.live -= 1;
                warn!(live = state.live, size = self.size, "pool shrank");
                // waiters must see an exhausted pool instead of sleeping forever
                self.available.notify_all();
            }
        }
    }
}

/// Hands out exclusive access to one of N independent backends at a time.
///
/// Each instance still runs one call at a time; the pool is what lets
/// several threads infer concurrently. An instance that comes back unusable
/// is never handed out again: it is rebuilt if the pool has a factory and
/// dropped otherwise.
#[derive(Clone)]
pub struct BackendPool {
    inner: Arc<PoolInner>,
}

impl BackendPool {
    /// Build `config.pool_size` backends from `config`. Retired instances
    /// are rebuilt from the same config.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        config.validate()?;
        let config = config.clone();
        let size = config.pool_size;
        Self::with_factory(size, Box::new(move || setup_inference_engine(&config)))
    }

    /// Build `size` backends with `factory`, which also replaces retired ones.
    pub fn with_factory(size: usize, factory: BackendFactory) -> Result<Self> {
        let backends = (0..size).map(|_| factory()).collect::<Result<Vec<_>>>()?;
        Self::build(backends, Some(factory))
    }

    /// Pool over existing instances. Retired instances are not replaced.
    pub fn new(backends: Vec<Backend>) -> Result<Self> {
        Self::build(backends, None)
    }

    fn build(backends: Vec<Backend>, factory: Option<BackendFactory>) -> Result<Self> {
        if backends.is_empty() {
            return Err(EngineError::Config("backend pool needs at least one instance".to_string()));
        }
        let size = backends.len();
        debug!(size, replaces = factory.is_some(), "created backend pool");
        Ok(BackendPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    idle: backends,
                    live: size,
                }),
                available: Condvar::new(),
                size,
                factory,
            }),
        })
    }

    /// Number of instances the pool was built with.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Instances still in service.
    pub fn live(&self) -> usize {
        self.inner.state.lock().live
    }

    /// Instances not currently checked out.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Block until an instance is free.
    ///
    /// Fails with `BackendUnusable` once every instance has been retired.
    pub fn acquire(&self) -> Result<PooledBackend> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(backend) = state.idle.pop() {
                return Ok(self.guard(backend));
            }
            if state.live == 0 {
                return Err(exhausted(self.inner.size));
            }
            self.inner.available.wait(&mut state);
        }
    }

    pub fn try_acquire(&self) -> Option<PooledBackend> {
        let backend = self.inner.state.lock().idle.pop()?;
        Some(self.guard(backend))
    }

    /// Wait at most `timeout` for an instance.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<PooledBackend> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(backend) = state.idle.pop() {
                return Some(self.guard(backend));
            }
            if state.live == 0 {
                return None;
            }
            if self.inner.available.wait_until(&mut state, deadline).timed_out() {
                return state.idle.pop().map(|b| self.guard(b));
            }
        }
    }

    fn guard(&self, backend: Backend) -> PooledBackend {
        PooledBackend {
            backend: Some(backend),
            pool: Arc::clone(&self.inner),
        }
    }
}

fn exhausted(size: usize) -> EngineError {
    EngineError::BackendUnusable(format!("all {} pooled backends have been retired", size))
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("BackendPool")
            .field("size", &self.inner.size)
            .field("live", &state.live)
            .field("idle", &state.idle.len())
            .finish()
    }
}

/// Exclusive use of one pooled backend; returned to the pool on drop.
pub struct PooledBackend {
    backend: Option<Backend>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBackend {
    type Target = dyn InferenceBackend;

    fn deref(&self) -> &Self::Target {
        match &self.backend {
            Some(b) => b.as_ref(),
            None => unreachable!("pooled backend used after return"),
        }
    }
}

impl DerefMut for PooledBackend {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.backend {
            Some(b) => b.as_mut(),
            None => unreachable!("pooled backend used after return"),
        }
    }
}

impl Drop for PooledBackend {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.take() {
            if backend.is_usable() {
                self.pool.state.lock().idle.push(backend);
                self.pool.available.notify_one();
            } else {
                self.pool.retire(backend);
            }
        }
    }
}
