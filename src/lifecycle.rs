//! Resource lifecycle manager: the single loaded engine and its lock.
//!
//! At most one engine is alive at a time.  It sits in a slot behind a
//! `tokio` mutex; holding the slot's guard *is* the right to generate, so the
//! mutex doubles as the single-flight guard:
//!
//! ```text
//! acquire(config) ── lock slot (wait / timeout / reject)
//!                 ── resolve config → key
//!                 ── key == loaded key?  reuse
//!                                  else  teardown, then walk load_plan()
//!                 ── EngineLease (owns the guard)
//! drop(lease)     ── unlock
//! ```
//!
//! Teardown calls [`SpeechEngine::release`] before dropping the engine and is
//! idempotent.  Because it needs the lock, it always waits for an in-flight
//! generation to finish first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::device::{load_plan, resolve, AttemptOutcome, Device, EngineConfig, ResolvedConfig};
use crate::engine::{EngineBackend, SpeechEngine};
use crate::error::{Error, Result};

/// What [`ResourceManager::acquire`] does when a generation is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AcquirePolicy {
    /// Queue behind the current holder, optionally giving up after `timeout`.
    Wait {
        #[serde(default, with = "opt_millis")]
        timeout: Option<Duration>,
    },
    /// Fail immediately with [`Error::ResourceBusy`].
    Reject,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        AcquirePolicy::Wait { timeout: None }
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Point-in-time view of the slot, for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub backend: String,
    pub loaded: bool,
    pub busy: bool,
    pub model_id: Option<String>,
    pub device: Option<Device>,
    /// Configuration actually loaded (after any fallback).
    pub effective: Option<ResolvedConfig>,
    pub reload_pending: bool,
}

/// A loaded engine plus the keys it was loaded under.
pub struct Loaded {
    /// Resolved request configuration; the reuse key.
    key: ResolvedConfig,
    /// Configuration that actually loaded.
    effective: ResolvedConfig,
    engine: Box<dyn SpeechEngine>,
}

#[derive(Default)]
pub struct Slot {
    loaded: Option<Loaded>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Owner of the one engine instance.  Cheap to clone; clones share the slot.
#[derive(Clone)]
pub struct ResourceManager {
    backend: Arc<dyn EngineBackend>,
    slot: Arc<Mutex<Slot>>,
    policy: AcquirePolicy,
    reload_required: Arc<AtomicBool>,
    status: Arc<RwLock<EngineStatus>>,
}

impl ResourceManager {
    pub fn new(backend: Arc<dyn EngineBackend>, policy: AcquirePolicy) -> Self {
        let status = EngineStatus { backend: backend.name().to_string(), ..Default::default() };
        Self {
            backend,
            slot: Arc::new(Mutex::new(Slot::default())),
            policy,
            reload_required: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(status)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn EngineBackend> {
        &self.backend
    }

    /// Flag shared with streaming workers; when set, the next acquire reloads
    /// the engine even if the configuration is unchanged.
    pub(crate) fn reload_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reload_required)
    }

    /// Force the next [`acquire`](Self::acquire) to tear down and reload.
    pub fn request_reload(&self) {
        self.reload_required.store(true, Ordering::SeqCst);
    }

    /// Lock the engine for one generation, loading or reloading as needed.
    pub async fn acquire(&self, config: &EngineConfig) -> Result<EngineLease> {
        let key = resolve(config, self.backend.as_ref())?;
        let mut guard = self.lock().await?;

        let reload = self.reload_required.swap(false, Ordering::SeqCst);
        let reusable = matches!(&guard.loaded, Some(l) if l.key == key);
        if reusable && !reload {
            debug!(model = %key.model_id, device = %key.device, "reusing loaded engine");
        } else {
            if reload && guard.loaded.is_some() {
                info!("reload requested, discarding current engine");
            }
            self.teardown(&mut guard);
            guard = self.load(guard, key).await?;
        }

        OwnedMutexGuard::try_map(guard, |slot| slot.loaded.as_mut())
            .map(|guard| EngineLease { guard })
            .map_err(|_| Error::EngineLoad("engine slot empty after load".into()))
    }

    /// Tear down the loaded engine, waiting for any in-flight generation.
    /// A no-op when nothing is loaded.
    pub async fn release(&self) {
        let mut guard = Arc::clone(&self.slot).lock_owned().await;
        self.teardown(&mut guard);
    }

    pub fn status(&self) -> EngineStatus {
        let mut status = match self.status.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        status.busy = self.slot.try_lock().is_err();
        status.reload_pending = self.reload_required.load(Ordering::SeqCst);
        status
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn lock(&self) -> Result<OwnedMutexGuard<Slot>> {
        let slot = Arc::clone(&self.slot);
        match self.policy {
            AcquirePolicy::Reject => slot
                .try_lock_owned()
                .map_err(|_| Error::ResourceBusy("a generation is already in flight".into())),
            AcquirePolicy::Wait { timeout: None } => Ok(slot.lock_owned().await),
            AcquirePolicy::Wait { timeout: Some(limit) } => {
                tokio::time::timeout(limit, slot.lock_owned())
                    .await
                    .map_err(|_| Error::ResourceBusy(format!("engine still busy after {limit:?}")))
            }
        }
    }

    fn teardown(&self, slot: &mut Slot) {
        if let Some(mut loaded) = slot.loaded.take() {
            loaded.engine.release();
            drop(loaded.engine);
            info!(model = %loaded.effective.model_id, "engine released");
        }
        self.publish(slot);
    }

    /// Load into the slot on the blocking pool.  The guard travels with the
    /// load, so the slot stays locked until it finishes even if the caller
    /// stops waiting.
    async fn load(
        &self,
        mut guard: OwnedMutexGuard<Slot>,
        key: ResolvedConfig,
    ) -> Result<OwnedMutexGuard<Slot>> {
        let backend = Arc::clone(&self.backend);
        let status = Arc::clone(&self.status);
        info!(
            model = %key.model_id,
            device = %key.device,
            precision = ?key.precision,
            attention = %key.attention,
            quantization = %key.quantization,
            "loading engine"
        );
        tokio::task::spawn_blocking(move || {
            let loaded = load_with_fallback(backend.as_ref(), key)?;
            guard.loaded = Some(loaded);
            publish(&status, &guard);
            Ok(guard)
        })
        .await
        .map_err(|e| Error::EngineLoad(format!("load task failed: {e}")))?
    }

    fn publish(&self, slot: &Slot) {
        publish(&self.status, slot);
    }
}

fn publish(status: &RwLock<EngineStatus>, slot: &Slot) {
    let mut status = match status.write() {
        Ok(s) => s,
        Err(poisoned) => poisoned.into_inner(),
    };
    status.loaded = slot.loaded.is_some();
    status.model_id = slot.loaded.as_ref().map(|l| l.effective.model_id.clone());
    status.device = slot.loaded.as_ref().map(|l| l.effective.device);
    status.effective = slot.loaded.as_ref().map(|l| l.effective.clone());
}

/// Walk the ordered attempts until one loads.
fn load_with_fallback(backend: &dyn EngineBackend, key: ResolvedConfig) -> Result<Loaded> {
    let mut outcomes: Vec<AttemptOutcome> = Vec::new();
    for attempt in load_plan(&key) {
        let candidate = attempt.apply(&key);
        match backend.load(&candidate) {
            Ok(engine) => {
                if !outcomes.is_empty() {
                    warn!(
                        attention = %candidate.attention,
                        quantization = %candidate.quantization,
                        failed_attempts = outcomes.len(),
                        "engine loaded with fallback configuration"
                    );
                }
                return Ok(Loaded { key, effective: candidate, engine });
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(
                    attention = %attempt.attention,
                    quantization = %attempt.quantization,
                    error = %message,
                    "engine load attempt failed"
                );
                outcomes.push(AttemptOutcome { attempt, error: Some(message) });
            }
        }
    }
    let summary = outcomes
        .iter()
        .map(|o| {
            format!(
                "{}/{}: {}",
                o.attempt.attention,
                o.attempt.quantization,
                o.error.as_deref().unwrap_or("?")
            )
        })
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::EngineLoad(format!("all load attempts failed for {}: {summary}", key.model_id)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Lease
// ─────────────────────────────────────────────────────────────────────────────

/// Exclusive access to the loaded engine.  Dropping it unlocks the slot.
pub struct EngineLease {
    guard: OwnedMappedMutexGuard<Slot, Loaded>,
}

impl EngineLease {
    pub fn engine_mut(&mut self) -> &mut dyn SpeechEngine {
        self.guard.engine.as_mut()
    }

    /// Configuration the engine actually runs with.
    pub fn config(&self) -> &ResolvedConfig {
        &self.guard.effective
    }

    pub fn sample_rate(&self) -> u32 {
        self.guard.engine.sample_rate()
    }
}

impl std::fmt::Debug for EngineLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineLease").field("config", self.config()).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
