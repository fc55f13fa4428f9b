//! In-memory queue of leased URL entries for one host.

use crate::error::Result;
use crate::hosts::RegisteredHost;
use crate::models::UrlEntry;
use crate::url_store::{Direction, UrlColumn, UrlQuery, UrlStore};
use log::{debug, error, trace};
use semcrawl_pipe::Stat;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Entries leased by one refill
pub const FETCH_SIZE: u32 = 50;

/// A refill starts once fewer entries than this are buffered
pub const FETCH_THRESHOLD: usize = 20;

/// Which URLs a refill leases
#[derive(Debug, Clone, PartialEq)]
pub struct RefillPlan {
    pub host_id: i64,
    pub source_first: bool,
    /// Entity pattern with its share of a refill, in declaration order
    pub quotas: Vec<(String, u32)>,
}

impl RefillPlan {
    pub fn for_host(host: &RegisteredHost) -> Self {
        let total = host.total_weight();
        let quotas = host
            .descriptor
            .entities
            .iter()
            .map(|e| {
                let share = if total == 0 {
                    0
                } else {
                    (e.weight as f64 / total as f64 * FETCH_SIZE as f64).round() as u32
                };
                (e.pattern.clone(), share)
            })
            .collect();
        Self {
            host_id: host.id,
            source_first: host.descriptor.source_first,
            quotas,
        }
    }

    fn base(&self) -> UrlQuery {
        UrlQuery::for_host(self.host_id)
            .not_locked()
            .working(true)
            .due()
            .order_by(UrlColumn::LastVisited, Direction::Asc)
    }

    fn sources(&self, limit: u32) -> UrlQuery {
        self.base().entity(false).limit(limit)
    }

    fn entities(&self, pattern: &str, limit: u32) -> UrlQuery {
        self.base().entity(true).pattern(pattern).limit(limit)
    }
}

#[derive(Default)]
struct BufferState {
    queue: VecDeque<UrlEntry>,
    refilling: bool,
    /// The last refill leased nothing
    exhausted: bool,
    /// Source-first hosts switch to weighted refills once this is set
    sources_done: bool,
    stopped: bool,
}

/// Prefetch buffer shared by the workers of a host
pub struct UrlBuffer {
    store: UrlStore,
    plan: RefillPlan,
    owner: i64,
    state: Mutex<BufferState>,
    refilled: Condvar,
    refill_thread: Mutex<Option<JoinHandle<()>>>,
    avg_fetch: Option<Arc<Stat>>,
}

impl UrlBuffer {
    /// `owner` is the lease owner recorded for every fetched entry
    pub fn new(store: UrlStore, plan: RefillPlan, owner: i64) -> Self {
        Self {
            store,
            plan,
            owner,
            state: Mutex::new(BufferState::default()),
            refilled: Condvar::new(),
            refill_thread: Mutex::new(None),
            avg_fetch: None,
        }
    }

    /// Records the duration of each refill
    pub fn with_fetch_stat(mut self, stat: Arc<Stat>) -> Self {
        self.avg_fetch = Some(stat);
        self
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next leased entry. Blocks while a refill is in flight and the queue is
    /// empty; `None` once a refill came back empty or the buffer is stopped.
    pub fn get_entry(self: &Arc<Self>) -> Option<UrlEntry> {
        let mut requested = false;
        let mut state = self.lock();
        loop {
            if state.stopped {
                return None;
            }
            let wanted = state.queue.is_empty()
                || (state.queue.len() < FETCH_THRESHOLD && !state.exhausted);
            if wanted && !state.refilling && !requested {
                requested = true;
                state.refilling = self.spawn_refill();
            }
            if let Some(entry) = state.queue.pop_front() {
                return Some(entry);
            }
            if !state.refilling {
                return None;
            }
            state = self
                .refilled
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Whether more entries may still arrive without new URLs being added
    pub fn has_more(&self) -> bool {
        let state = self.lock();
        !state.stopped && (!state.queue.is_empty() || state.refilling || !state.exhausted)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts a refill thread; called with the state lock held
    fn spawn_refill(self: &Arc<Self>) -> bool {
        let buffer = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("refill-{}", self.plan.host_id))
            .spawn(move || buffer.refill());
        match spawned {
            Ok(handle) => {
                let mut slot = self.refill_thread.lock().unwrap_or_else(|e| e.into_inner());
                // a previous handle belongs to a finished refill
                *slot = Some(handle);
                true
            }
            Err(e) => {
                error!("Can't start refill for host {}: {}", self.plan.host_id, e);
                false
            }
        }
    }

    fn refill(&self) {
        let started = Instant::now();
        let entries = match self.lease() {
            Ok(entries) => entries,
            Err(e) => {
                error!("URL refill for host {} failed: {}", self.plan.host_id, e);
                Vec::new()
            }
        };
        if let Some(stat) = &self.avg_fetch {
            stat.add_duration(started.elapsed());
        }
        trace!("Refilled {} entries for host {}", entries.len(), self.plan.host_id);

        let mut state = self.lock();
        state.exhausted = entries.is_empty();
        state.queue.extend(entries);
        state.refilling = false;
        self.refilled.notify_all();
    }

    fn lease(&self) -> Result<Vec<UrlEntry>> {
        let sources_done = self.lock().sources_done;
        if self.plan.source_first && !sources_done {
            let batch = self
                .store
                .fetch_entries(&self.plan.sources(FETCH_SIZE), self.owner)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            debug!("Host {}: source URLs exhausted", self.plan.host_id);
            self.lock().sources_done = true;
        }

        let mut entries = Vec::new();
        for (pattern, quota) in &self.plan.quotas {
            if *quota > 0 {
                entries.extend(
                    self.store
                        .fetch_entries(&self.plan.entities(pattern, *quota), self.owner)?,
                );
            }
        }
        let rest = FETCH_SIZE.saturating_sub(entries.len() as u32);
        if rest > 0 {
            entries.extend(self.store.fetch_entries(&self.plan.sources(rest), self.owner)?);
        }
        Ok(entries)
    }

    /// Waits for a running refill, then releases the leases of every
    /// buffered entry
    pub fn stop(&self) {
        self.lock().stopped = true;
        let handle = self
            .refill_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Refill thread of host {} panicked", self.plan.host_id);
            }
        }

        let unused: Vec<UrlEntry> = {
            let mut state = self.lock();
            self.refilled.notify_all();
            state.queue.drain(..).collect()
        };
        if !unused.is_empty() {
            debug!("Returning {} unused leases of host {}", unused.len(), self.plan.host_id);
            if let Err(e) = self.store.unlock_urls(&unused) {
                error!("Can't release leases of host {}: {}", self.plan.host_id, e);
            }
        }
    }
}
