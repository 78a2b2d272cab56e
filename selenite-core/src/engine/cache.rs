//! Process-wide engine session cache.
//!
//! Loaded sessions are keyed by `(kind, provider, weight_path)` and
//! reference-counted across concurrent workers. Concurrent `load()`s of the
//! same key coalesce behind a per-key slot: one thread loads, the rest wait
//! on the slot's condvar. Eviction is LRU over idle sessions only — an entry
//! with leases outstanding is never unloaded, so eviction effectively waits
//! for refcount zero.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, SeleniteError};
use crate::registry::ModelKind;

use super::{AsrHandle, DiarizerHandle};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: ModelKind,
    pub provider: String,
    pub weight_path: PathBuf,
}

#[derive(Clone)]
pub enum SessionHandle {
    Asr(AsrHandle),
    Diarizer(DiarizerHandle),
}

enum SlotState {
    Empty,
    Loading,
    Ready {
        handle: SessionHandle,
        refs: usize,
        last_used: u64,
    },
}

struct Slot {
    cell: Mutex<SlotState>,
    cond: Condvar,
}

struct CacheInner {
    max_sessions: usize,
    load_timeout: Duration,
    entries: Mutex<HashMap<CacheKey, Arc<Slot>>>,
    tick: AtomicU64,
}

/// Cheaply clonable handle; clones share the session table.
#[derive(Clone)]
pub struct EngineCache {
    inner: Arc<CacheInner>,
}

/// Lease on a cached session. Dropping it releases the refcount and makes
/// the session eligible for eviction again.
pub struct SessionLease {
    inner: Arc<CacheInner>,
    key: CacheKey,
    handle: SessionHandle,
}

impl SessionLease {
    pub fn asr(&self) -> Option<AsrHandle> {
        match &self.handle {
            SessionHandle::Asr(handle) => Some(handle.clone()),
            SessionHandle::Diarizer(_) => None,
        }
    }

    pub fn diarizer(&self) -> Option<DiarizerHandle> {
        match &self.handle {
            SessionHandle::Diarizer(handle) => Some(handle.clone()),
            SessionHandle::Asr(_) => None,
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

impl EngineCache {
    pub fn new(max_sessions: usize, load_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                max_sessions: max_sessions.max(1),
                load_timeout,
                entries: Mutex::new(HashMap::new()),
                tick: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch a cached session or load one, coalescing with any concurrent
    /// load of the same key. The loader runs on a helper thread and is
    /// abandoned after `load_timeout`, surfacing as `EngineTransient`.
    pub fn get_or_load(
        &self,
        key: CacheKey,
        loader: impl FnOnce() -> Result<SessionHandle> + Send + 'static,
    ) -> Result<SessionLease> {
        let inner = &self.inner;
        let slot = {
            let mut entries = inner.entries.lock();
            Arc::clone(entries.entry(key.clone()).or_insert_with(|| {
                Arc::new(Slot {
                    cell: Mutex::new(SlotState::Empty),
                    cond: Condvar::new(),
                })
            }))
        };

        {
            let mut state = slot.cell.lock();
            loop {
                match &mut *state {
                    SlotState::Ready {
                        handle,
                        refs,
                        last_used,
                    } => {
                        *refs += 1;
                        *last_used = inner.tick.fetch_add(1, Ordering::Relaxed);
                        debug!(provider = %key.provider, weight = %key.weight_path.display(), refs = *refs, "engine cache hit");
                        return Ok(SessionLease {
                            inner: Arc::clone(inner),
                            key,
                            handle: handle.clone(),
                        });
                    }
                    SlotState::Loading => {
                        slot.cond.wait(&mut state);
                    }
                    SlotState::Empty => {
                        *state = SlotState::Loading;
                        break;
                    }
                }
            }
        }

        // This thread owns the load for this key.
        let loaded = inner.load_with_timeout(&key, loader);
        let lease = {
            let mut state = slot.cell.lock();
            match loaded {
                Ok(handle) => {
                    *state = SlotState::Ready {
                        handle: handle.clone(),
                        refs: 1,
                        last_used: inner.tick.fetch_add(1, Ordering::Relaxed),
                    };
                    slot.cond.notify_all();
                    Ok(SessionLease {
                        inner: Arc::clone(inner),
                        key: key.clone(),
                        handle,
                    })
                }
                Err(err) => {
                    *state = SlotState::Empty;
                    slot.cond.notify_all();
                    Err(err)
                }
            }
        };
        if lease.is_ok() {
            inner.evict_idle();
        }
        lease
    }

    /// Count of currently loaded sessions (any refcount).
    pub fn loaded_sessions(&self) -> usize {
        let entries = self.inner.entries.lock();
        entries
            .values()
            .filter(|slot| matches!(&*slot.cell.lock(), SlotState::Ready { .. }))
            .count()
    }
}

impl CacheInner {
    fn load_with_timeout(
        &self,
        key: &CacheKey,
        loader: impl FnOnce() -> Result<SessionHandle> + Send + 'static,
    ) -> Result<SessionHandle> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let spawn = std::thread::Builder::new()
            .name("selenite-engine-load".into())
            .spawn(move || {
                let _ = tx.send(loader());
            });
        if let Err(err) = spawn {
            return Err(SeleniteError::EngineTransient(format!(
                "failed to spawn engine load thread: {err}"
            )));
        }
        info!(provider = %key.provider, weight = %key.weight_path.display(), "loading engine session");
        match rx.recv_timeout(self.load_timeout) {
            Ok(result) => result,
            Err(_) => {
                warn!(provider = %key.provider, weight = %key.weight_path.display(),
                      timeout_secs = self.load_timeout.as_secs(), "engine load timed out");
                Err(SeleniteError::EngineTransient(format!(
                    "engine load timed out after {}s",
                    self.load_timeout.as_secs()
                )))
            }
        }
    }

    fn release(&self, key: &CacheKey) {
        let slot = {
            let entries = self.entries.lock();
            entries.get(key).cloned()
        };
        if let Some(slot) = slot {
            let mut state = slot.cell.lock();
            if let SlotState::Ready { refs, last_used, .. } = &mut *state {
                *refs = refs.saturating_sub(1);
                *last_used = self.tick.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.evict_idle();
    }

    /// Unload least-recently-used idle sessions until at most
    /// `max_sessions` remain loaded.
    fn evict_idle(&self) {
        let entries = self.entries.lock();
        let mut loaded = 0usize;
        let mut idle: Vec<(CacheKey, u64, Arc<Slot>)> = Vec::new();
        for (key, slot) in entries.iter() {
            let state = slot.cell.lock();
            if let SlotState::Ready { refs, last_used, .. } = &*state {
                loaded += 1;
                if *refs == 0 {
                    idle.push((key.clone(), *last_used, Arc::clone(slot)));
                }
            }
        }
        if loaded <= self.max_sessions {
            return;
        }
        idle.sort_by_key(|(_, last_used, _)| *last_used);
        let mut to_evict = loaded - self.max_sessions;
        for (key, _, slot) in idle {
            if to_evict == 0 {
                break;
            }
            let mut state = slot.cell.lock();
            if let SlotState::Ready { refs: 0, .. } = &*state {
                *state = SlotState::Empty;
                to_evict -= 1;
                info!(provider = %key.provider, weight = %key.weight_path.display(), "evicted idle engine session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AsrSession, TranscribeRequest, TranscriptDraft};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    struct NoopSession;

    impl AsrSession for NoopSession {
        fn transcribe(
            &mut self,
            _media_path: &Path,
            _request: &TranscribeRequest<'_>,
        ) -> Result<TranscriptDraft> {
            Ok(TranscriptDraft {
                segments: vec![],
                language_detected: None,
                duration: 0.0,
            })
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey {
            kind: ModelKind::Asr,
            provider: "whisper".into(),
            weight_path: PathBuf::from(format!("/models/whisper/{name}")),
        }
    }

    fn noop_loader() -> Result<SessionHandle> {
        Ok(SessionHandle::Asr(AsrHandle::new(Box::new(NoopSession))))
    }

    #[test]
    fn second_lookup_reuses_the_loaded_session() {
        let cache = EngineCache::new(2, Duration::from_secs(5));
        let loads = Arc::new(AtomicUsize::new(0));

        let loads_a = Arc::clone(&loads);
        let lease_a = cache
            .get_or_load(key("tiny"), move || {
                loads_a.fetch_add(1, Ordering::SeqCst);
                noop_loader()
            })
            .expect("first load");
        let loads_b = Arc::clone(&loads);
        let lease_b = cache
            .get_or_load(key("tiny"), move || {
                loads_b.fetch_add(1, Ordering::SeqCst);
                noop_loader()
            })
            .expect("second load");

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(lease_a.asr().is_some());
        assert!(lease_b.asr().is_some());
        assert_eq!(cache.loaded_sessions(), 1);
    }

    #[test]
    fn concurrent_loads_of_one_key_coalesce() {
        let cache = EngineCache::new(2, Duration::from_secs(5));
        let loads = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let loads = Arc::clone(&loads);
            handles.push(std::thread::spawn(move || {
                cache.get_or_load(key("tiny"), move || {
                    loads.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    noop_loader()
                })
            }));
        }
        for handle in handles {
            assert!(handle.join().expect("thread").is_ok());
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_sessions_are_evicted_lru_beyond_the_cap() {
        let cache = EngineCache::new(1, Duration::from_secs(5));

        let lease_a = cache.get_or_load(key("tiny"), noop_loader).expect("load a");
        drop(lease_a);
        let lease_b = cache.get_or_load(key("base"), noop_loader).expect("load b");

        // "tiny" was idle, "base" holds a lease: only "base" stays loaded.
        assert_eq!(cache.loaded_sessions(), 1);
        drop(lease_b);
    }

    #[test]
    fn leased_sessions_survive_eviction_pressure() {
        let cache = EngineCache::new(1, Duration::from_secs(5));

        let lease_a = cache.get_or_load(key("tiny"), noop_loader).expect("load a");
        let lease_b = cache.get_or_load(key("base"), noop_loader).expect("load b");

        // Both over the cap, but both leased: nothing can be evicted yet.
        assert_eq!(cache.loaded_sessions(), 2);
        drop(lease_a);
        drop(lease_b);
        assert_eq!(cache.loaded_sessions(), 1);
    }

    #[test]
    fn failed_load_clears_the_slot_for_retry() {
        let cache = EngineCache::new(2, Duration::from_secs(5));
        let result = cache.get_or_load(key("tiny"), || {
            Err(SeleniteError::EngineUnavailable("missing runtime".into()))
        });
        assert!(matches!(result, Err(SeleniteError::EngineUnavailable(_))));

        let retried = cache.get_or_load(key("tiny"), noop_loader);
        assert!(retried.is_ok());
    }

    #[test]
    fn slow_load_times_out_as_transient() {
        let cache = EngineCache::new(2, Duration::from_millis(50));
        let result = cache.get_or_load(key("tiny"), || {
            std::thread::sleep(Duration::from_millis(500));
            noop_loader()
        });
        assert!(matches!(result, Err(SeleniteError::EngineTransient(_))));
    }
}
