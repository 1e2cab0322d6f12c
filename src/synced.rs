//! Close-safe wrapper around a live engine.
//!
//! The registry destroys engines while request handlers may still hold handle
//! clones from a moment earlier. Every operation here goes through a shared
//! lock and a state check, so once an engine is released no call path can
//! reach it again; late callers get [`RuntimeError::Closed`] instead.

use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use tokio::sync::RwLock;

use crate::{
    engine::{Engine, PredictCallback, PredictRequest},
    error::{RuntimeError, RuntimeResult},
};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Wraps an engine so read-style operations can run concurrently with each
/// other but never concurrently with, or after, its release.
pub struct SyncedEngine {
    inner: Box<dyn Engine>,
    // Three-state tag so a second shutdown() is a guarded no-op.
    state: AtomicU8,
    lock: RwLock<()>,
}

impl SyncedEngine {
    pub fn new(inner: Box<dyn Engine>) -> Self {
        Self {
            inner,
            state: AtomicU8::new(OPEN),
            lock: RwLock::new(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN
    }

    pub async fn predict(
        &self,
        request: PredictRequest,
        on_chunk: PredictCallback,
    ) -> RuntimeResult<()> {
        let _guard = self.read_open().await?;
        Ok(self.inner.predict(request, on_chunk).await?)
    }

    pub async fn embedding(&self, input: &str) -> RuntimeResult<Vec<f64>> {
        let _guard = self.read_open().await?;
        Ok(self.inner.embedding(input).await?)
    }

    pub async fn encode(&self, text: &str) -> RuntimeResult<Vec<u32>> {
        let _guard = self.read_open().await?;
        Ok(self.inner.encode(text).await?)
    }

    pub async fn decode(&self, tokens: &[u32]) -> RuntimeResult<String> {
        let _guard = self.read_open().await?;
        Ok(self.inner.decode(tokens).await?)
    }

    /// Release the underlying engine.
    ///
    /// Waits for in-flight operations (shared-lock holders) to drain, then
    /// forwards the release exactly once. Subsequent calls return without
    /// touching the engine.
    pub async fn shutdown(&self) {
        let _guard = self.lock.write().await;
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.inner.shutdown().await;
        self.state.store(CLOSED, Ordering::Release);
    }

    async fn read_open(&self) -> RuntimeResult<tokio::sync::RwLockReadGuard<'_, ()>> {
        let guard = self.lock.read().await;
        if self.state.load(Ordering::Acquire) != OPEN {
            return Err(RuntimeError::Closed);
        }
        Ok(guard)
    }
}

impl fmt::Debug for SyncedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedEngine")
            .field("closed", &self.is_closed())
            .finish()
    }
}
