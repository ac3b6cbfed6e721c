use crate::task::handle::{Task, TaskValue};
use crate::task::scheduler::Scheduler;
use crate::task::types::*;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Keys a [`KeyedTaskCache`] can be indexed by
pub trait CacheKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<K: Eq + Hash + Clone + Debug + Send + Sync + 'static> CacheKey for K {}

/// Tasks that together compute one value, e.g. fetch then transform.
///
/// The last task is the sink: its output is the chain's result.
pub struct Chain<T: TaskValue> {
    tasks: Vec<Task<T>>,
}

impl<T: TaskValue> Chain<T> {
    pub fn new(task: Task<T>) -> Self {
        Self { tasks: vec![task] }
    }

    /// Append a task that depends on the current sink
    pub fn then(mut self, task: Task<T>) -> Result<Self, SchedulerError> {
        task.add_dependency(self.sink())?;
        self.tasks.push(task);
        Ok(self)
    }

    /// Build a chain from tasks whose edges are already established
    pub fn from_tasks(tasks: Vec<Task<T>>) -> Result<Self, SchedulerError> {
        if tasks.is_empty() {
            return Err(SchedulerError::EmptyChain);
        }
        Ok(Self { tasks })
    }

    pub fn sink(&self) -> &Task<T> {
        // Construction guarantees at least one task
        &self.tasks[self.tasks.len() - 1]
    }

    pub fn tasks(&self) -> &[Task<T>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Result of a cache request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// A completed value was already cached; nothing was scheduled
    Cached(T),
    /// A new chain was submitted and superseded any earlier one
    Scheduled { generation: u64, sink: TaskId },
}

struct ActiveChain<T: TaskValue> {
    generation: u64,
    tasks: Vec<Task<T>>,
}

struct CacheEntry<T: TaskValue> {
    active: Option<ActiveChain<T>>,
    cached: Option<T>,
}

impl<T: TaskValue> Default for CacheEntry<T> {
    fn default() -> Self {
        Self {
            active: None,
            cached: None,
        }
    }
}

type CacheFilter<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct CacheInner<K: CacheKey, T: TaskValue> {
    scheduler: Scheduler<T>,
    entries: DashMap<K, CacheEntry<T>>,
    next_generation: AtomicU64,
    filter: Option<CacheFilter<T>>,
}

/// At most one in-flight chain per key, with completed values cached.
///
/// Requesting a key that has no cached value cancels whatever chain was
/// running for it and starts a new one. Completions from a superseded chain
/// are dropped, so a requester only ever sees the latest chain's value.
pub struct KeyedTaskCache<K: CacheKey, T: TaskValue> {
    inner: Arc<CacheInner<K, T>>,
}

impl<K: CacheKey, T: TaskValue> KeyedTaskCache<K, T> {
    pub fn new(scheduler: Scheduler<T>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                scheduler,
                entries: DashMap::new(),
                next_generation: AtomicU64::new(1),
                filter: None,
            }),
        }
    }

    /// Only cache values accepted by `filter`.
    ///
    /// Rejected values are still delivered to the requester; the next request
    /// for the key simply schedules new work.
    pub fn with_cache_filter(
        scheduler: Scheduler<T>,
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                scheduler,
                entries: DashMap::new(),
                next_generation: AtomicU64::new(1),
                filter: Some(Box::new(filter)),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler<T> {
        &self.inner.scheduler
    }

    /// Get the value for `key`, computing it with a fresh chain if needed.
    ///
    /// `builder` is only called on a cache miss. `on_ready` fires at most
    /// once, after the chain's sink completes, and never if this request is
    /// superseded or cancelled first. The cache owns the sink's completion
    /// callback; any callback registered on it beforehand is replaced.
    pub fn request<B, F>(
        &self,
        key: K,
        builder: B,
        on_ready: F,
    ) -> Result<Lookup<T>, SchedulerError>
    where
        B: FnOnce() -> Result<Chain<T>, SchedulerError>,
        F: FnOnce(T) + Send + 'static,
    {
        if let Some(value) = self.cached(&key) {
            debug!("Cache hit for {:?}", key);
            return Ok(Lookup::Cached(value));
        }

        // Built outside the entry lock so the builder may freely touch the cache
        let chain = builder()?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let sink = chain.sink().clone();

        let previous = {
            let mut entry = self.inner.entries.entry(key.clone()).or_default();
            if let Some(value) = &entry.cached {
                debug!("Cache filled for {:?} while building a chain", key);
                return Ok(Lookup::Cached(value.clone()));
            }
            entry.active.replace(ActiveChain {
                generation,
                tasks: chain.tasks().to_vec(),
            })
        };

        if let Some(previous) = previous {
            let cancelled = self.cancel_chain(&previous);
            info!(
                "Superseded chain {} for {:?} with chain {} ({} tasks cancelled)",
                previous.generation, key, generation, cancelled
            );
        }

        let cache = Arc::downgrade(&self.inner);
        let completion_key = key.clone();
        sink.on_complete(move |outcome| {
            complete(&cache, completion_key, generation, outcome, on_ready);
        });

        if let Err(err) = self.inner.scheduler.submit_all(chain.tasks().iter().cloned()) {
            self.inner.entries.remove_if_mut(&key, |_, entry| {
                if entry.active.as_ref().is_some_and(|a| a.generation == generation) {
                    entry.active = None;
                }
                entry.active.is_none() && entry.cached.is_none()
            });
            return Err(err);
        }

        debug!(
            "Scheduled chain {} for {:?} ({} tasks)",
            generation,
            key,
            chain.len()
        );
        Ok(Lookup::Scheduled {
            generation,
            sink: sink.id(),
        })
    }

    /// Cancel the active chain for `key`, keeping any cached value.
    ///
    /// Returns false if nothing was in flight.
    pub fn cancel(&self, key: &K) -> bool {
        let active = self
            .inner
            .entries
            .get_mut(key)
            .and_then(|mut entry| entry.active.take());
        self.inner
            .entries
            .remove_if(key, |_, entry| entry.active.is_none() && entry.cached.is_none());

        match active {
            Some(active) => {
                let cancelled = self.cancel_chain(&active);
                debug!(
                    "Cancelled chain {} for {:?} ({} tasks)",
                    active.generation, key, cancelled
                );
                true
            }
            None => false,
        }
    }

    /// Forget the cached value and cancel any chain for `key`.
    ///
    /// Returns false if nothing was tracked for the key.
    pub fn invalidate(&self, key: &K) -> bool {
        let Some((_, entry)) = self.inner.entries.remove(key) else {
            return false;
        };
        if let Some(active) = entry.active {
            self.cancel_chain(&active);
        }
        debug!("Invalidated {:?}", key);
        true
    }

    pub fn cached(&self, key: &K) -> Option<T> {
        self.inner
            .entries
            .get(key)
            .and_then(|entry| entry.cached.clone())
    }

    /// Whether a chain is currently in flight for `key`
    pub fn is_pending(&self, key: &K) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.active.is_some())
    }

    /// Number of keys with a cached value or an active chain
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Cancel every member of a chain.
    ///
    /// Members that have not been submitted yet keep the flag and are retired
    /// without running as soon as they reach the scheduler.
    fn cancel_chain(&self, chain: &ActiveChain<T>) -> usize {
        chain.tasks.iter().filter(|task| task.cancel()).count()
    }
}

impl<K: CacheKey, T: TaskValue> Clone for KeyedTaskCache<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Accept a sink's outcome if it still belongs to the key's active chain
fn complete<K, T, F>(
    cache: &Weak<CacheInner<K, T>>,
    key: K,
    generation: u64,
    outcome: Outcome<T>,
    on_ready: F,
) where
    K: CacheKey,
    T: TaskValue,
    F: FnOnce(T),
{
    let Some(cache) = cache.upgrade() else {
        return;
    };

    let delivered = {
        let Some(mut entry) = cache.entries.get_mut(&key) else {
            debug!("Dropping completion for untracked key {:?}", key);
            return;
        };
        let current = entry
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation);
        if !current {
            debug!(
                "Dropping stale completion of chain {} for {:?}",
                generation, key
            );
            return;
        }
        entry.active = None;

        match outcome {
            Outcome::Completed(value) => {
                let keep = cache.filter.as_ref().is_none_or(|filter| filter(&value));
                if keep {
                    entry.cached = Some(value.clone());
                }
                Some(value)
            }
            Outcome::Cancelled => {
                debug!("Chain {} for {:?} finished as cancelled", generation, key);
                None
            }
        }
    };

    cache
        .entries
        .remove_if(&key, |_, entry| entry.active.is_none() && entry.cached.is_none());

    if let Some(value) = delivered {
        on_ready(value);
    }
}
