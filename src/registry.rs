//! Single-slot engine registry with idle eviction.
//!
//! At most one engine is resident at a time. `load` decides between reusing
//! the resident engine, rebuilding it (descriptor or options changed), or
//! populating an empty slot; every load also pushes the idle deadline out.
//! A background watcher task releases the engine once the deadline truly
//! passes, and explicit `close` tears everything down.
//!
//! Two lock domains: the slot lock serializes loads, closes, and evictions
//! against each other and against `runner` reads; the expiry lock covers only
//! the deadline so refreshing it never contends with a slow reload. When both
//! are needed, the slot lock is taken first.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, RwLock},
    time::Instant,
};
use tracing::{debug, info};

use crate::{
    engine::{EngineDescriptor, EngineLoader, EngineOptions},
    error::{RuntimeError, RuntimeResult},
    synced::SyncedEngine,
};

/// Idle timeout applied by callers that have no explicit keep-alive.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);

struct Resident {
    engine: Arc<SyncedEngine>,
    descriptor: EngineDescriptor,
    options: EngineOptions,
}

struct ExpiryState {
    deadline: Option<Instant>,
    watcher_started: bool,
}

struct RegistryInner {
    slot: RwLock<Option<Resident>>,
    expiry: Mutex<ExpiryState>,
    rearm: Arc<Notify>,
    loader: Arc<dyn EngineLoader>,
}

/// The registry owning the single engine slot. Not a process-wide global;
/// callers hold and inject an instance.
pub struct EngineRegistry {
    inner: Arc<RegistryInner>,
}

impl EngineRegistry {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slot: RwLock::new(None),
                expiry: Mutex::new(ExpiryState {
                    deadline: None,
                    watcher_started: false,
                }),
                rearm: Arc::new(Notify::new()),
                loader,
            }),
        }
    }

    /// Get a handle to an engine for (descriptor, options), building one if
    /// the slot is empty or holds a different configuration, and extend its
    /// lifetime to `now + idle_timeout`.
    ///
    /// Repeated loads with an identical configuration never reconstruct the
    /// engine. Any change to descriptor or options destroys the old engine
    /// before the new one is built; the two are never resident together.
    pub async fn load(
        &self,
        descriptor: &EngineDescriptor,
        options: &EngineOptions,
        idle_timeout: Duration,
    ) -> RuntimeResult<Arc<SyncedEngine>> {
        let needs_reload = {
            let slot = self.inner.slot.read().await;
            match slot.as_ref() {
                None => true,
                Some(resident) => {
                    resident.descriptor != *descriptor || resident.options != *options
                }
            }
        };

        if needs_reload {
            self.reload(descriptor, options).await?;
        }

        self.refresh_timer(idle_timeout);

        let slot = self.inner.slot.read().await;
        match slot.as_ref() {
            Some(resident) => Ok(Arc::clone(&resident.engine)),
            // An eviction or close slipped in between; the caller can retry.
            None => Err(RuntimeError::Closed),
        }
    }

    /// The currently resident handle, if any. No side effects: the idle
    /// deadline is not refreshed.
    pub async fn runner(&self) -> Option<Arc<SyncedEngine>> {
        self.inner
            .slot
            .read()
            .await
            .as_ref()
            .map(|resident| Arc::clone(&resident.engine))
    }

    /// Descriptor of the currently resident engine, if any.
    pub async fn descriptor(&self) -> Option<EngineDescriptor> {
        self.inner
            .slot
            .read()
            .await
            .as_ref()
            .map(|resident| resident.descriptor.clone())
    }

    /// Release the resident engine and clear all expiry state. A no-op when
    /// the slot is already empty.
    pub async fn close(&self) {
        let mut slot = self.inner.slot.write().await;
        {
            let mut expiry = self.inner.expiry.lock();
            expiry.deadline = None;
        }
        self.inner.rearm.notify_one();
        if let Some(resident) = slot.take() {
            info!(model = %resident.descriptor.short_name, "closing resident engine");
            resident.engine.shutdown().await;
        }
    }

    /// Destroy-then-rebuild under the exclusive slot lock.
    ///
    /// Construction runs while the lock is held: at most one build at a time,
    /// and concurrent load/runner/close calls block until it finishes. On
    /// failure the slot is left empty so the next load retries cleanly.
    async fn reload(
        &self,
        descriptor: &EngineDescriptor,
        options: &EngineOptions,
    ) -> RuntimeResult<()> {
        let mut slot = self.inner.slot.write().await;

        // A concurrent load may have installed the same configuration while
        // we waited for the lock.
        if let Some(resident) = slot.as_ref() {
            if resident.descriptor == *descriptor && resident.options == *options {
                return Ok(());
            }
        }

        if let Some(old) = slot.take() {
            info!(model = %old.descriptor.short_name, "changing loaded model");
            old.engine.shutdown().await;
        }

        let engine = self
            .inner
            .loader
            .load(descriptor, options)
            .await
            .map_err(|err| RuntimeError::from_load(err, &descriptor.short_name))?;

        *slot = Some(Resident {
            engine: Arc::new(SyncedEngine::new(engine)),
            descriptor: descriptor.clone(),
            options: options.clone(),
        });
        Ok(())
    }

    /// Push the idle deadline to `now + idle_timeout` and wake the watcher so
    /// it picks the new deadline up. The watcher task is spawned lazily on
    /// the first load and reused for the registry's lifetime.
    fn refresh_timer(&self, idle_timeout: Duration) {
        let deadline = Instant::now() + idle_timeout;
        {
            let mut expiry = self.inner.expiry.lock();
            expiry.deadline = Some(deadline);
            if !expiry.watcher_started {
                expiry.watcher_started = true;
                spawn_watcher(
                    Arc::downgrade(&self.inner),
                    Arc::clone(&self.inner.rearm),
                );
            }
        }
        self.inner.rearm.notify_one();
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        // Wake a parked watcher so it can observe the dead Weak and exit.
        self.inner.rearm.notify_one();
    }
}

impl RegistryInner {
    /// Timer-fire path. Re-validates the deadline under the slot lock: a load
    /// that raced with the fire has already moved the deadline forward, in
    /// which case this fire is stale and must not evict (and must not rearm,
    /// the watcher already tracks the new deadline).
    async fn evict_if_expired(&self) {
        let mut slot = self.slot.write().await;
        {
            let mut expiry = self.expiry.lock();
            match expiry.deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    expiry.deadline = None;
                }
                _ => {
                    debug!("stale idle-timer fire, deadline was extended");
                    return;
                }
            }
        }
        if let Some(resident) = slot.take() {
            info!(model = %resident.descriptor.short_name, "idle timeout reached, releasing engine");
            resident.engine.shutdown().await;
        }
    }
}

/// One watcher per registry. Sleeps until the current deadline, parks when
/// there is none, and is woken by `rearm` whenever the deadline changes. It
/// holds only a weak reference, so dropping the registry ends the task.
fn spawn_watcher(inner: Weak<RegistryInner>, rearm: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            let deadline = match inner.upgrade() {
                Some(registry) => registry.expiry.lock().deadline,
                None => return,
            };
            match deadline {
                None => rearm.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {
                            let Some(registry) = inner.upgrade() else { return };
                            registry.evict_if_expired().await;
                        }
                        _ = rearm.notified() => {}
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        engine::{Engine, PredictCallback, PredictRequest},
        error::LoadError,
    };

    struct NullEngine;

    #[async_trait]
    impl Engine for NullEngine {
        async fn predict(
            &self,
            _request: PredictRequest,
            _on_chunk: PredictCallback,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn embedding(&self, _input: &str) -> anyhow::Result<Vec<f64>> {
            Ok(Vec::new())
        }

        async fn encode(&self, _text: &str) -> anyhow::Result<Vec<u32>> {
            Ok(Vec::new())
        }

        async fn decode(&self, _tokens: &[u32]) -> anyhow::Result<String> {
            Ok(String::new())
        }

        async fn shutdown(&self) {}
    }

    struct NullLoader {
        builds: AtomicUsize,
    }

    #[async_trait]
    impl EngineLoader for NullLoader {
        async fn load(
            &self,
            _descriptor: &EngineDescriptor,
            _options: &EngineOptions,
        ) -> Result<Box<dyn Engine>, LoadError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullEngine))
        }
    }

    fn test_registry() -> EngineRegistry {
        EngineRegistry::new(Arc::new(NullLoader {
            builds: AtomicUsize::new(0),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fire_does_not_evict() {
        let registry = test_registry();
        let descriptor = EngineDescriptor::new("/models/a.bin", "a");
        registry
            .load(&descriptor, &EngineOptions::default(), Duration::from_secs(60))
            .await
            .unwrap();

        // Fire early: the deadline is still a minute out, so the guard must
        // treat this as stale and leave the slot alone.
        registry.inner.evict_if_expired().await;
        assert!(registry.runner().await.is_some());

        // Once the deadline genuinely passes, the same path evicts.
        tokio::time::advance(Duration::from_secs(61)).await;
        registry.inner.evict_if_expired().await;
        assert!(registry.runner().await.is_none());
    }

    #[tokio::test]
    async fn close_on_empty_slot_is_noop() {
        let registry = test_registry();
        registry.close().await;
        registry.close().await;
        assert!(registry.runner().await.is_none());
    }

    #[tokio::test]
    async fn runner_does_not_refresh_deadline() {
        let registry = test_registry();
        let descriptor = EngineDescriptor::new("/models/a.bin", "a");
        registry
            .load(&descriptor, &EngineOptions::default(), Duration::from_secs(60))
            .await
            .unwrap();
        let before = registry.inner.expiry.lock().deadline;
        let _ = registry.runner().await;
        assert_eq!(registry.inner.expiry.lock().deadline, before);
    }
}
