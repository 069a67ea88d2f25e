//! Store pool: per-node registry of every known store and its health.
//!
//! Gossip callbacks feed descriptor and dead-replica updates into the pool, a
//! background worker ages out stores that stop reporting, and placement
//! callers query for stores that are alive, attribute-matched, and not
//! throttled by a recent failed or declined reservation.
//!
//! One read/write lock guards the registry map and the liveness queue
//! together; their membership is joint and every mutation touches both.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use vela_base::gossip::Gossip;
use vela_base::hlc::{Clock, Timestamp};
use vela_base::stopper::Stopper;

use crate::descriptor::{
    RangeId, ReplicaDescriptor, StoreCapacity, StoreDeadReplicas, StoreDescriptor, StoreId,
    DEAD_REPLICAS_GOSSIP_PREFIX, STORE_GOSSIP_PREFIX,
};
use crate::resolver::{gossip_address_resolver, NodeAddressResolver};

/// Test value for `time_until_store_dead` that ages stores out quickly.
pub const TEST_TIME_UNTIL_STORE_DEAD: Duration = Duration::from_millis(5);

/// Test value for `time_until_store_dead` that never marks a store dead.
pub const TEST_TIME_UNTIL_STORE_DEAD_OFF: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_TIME_UNTIL_STORE_DEAD: Duration = Duration::from_secs(5 * 60);
const DEFAULT_FAILED_RESERVATIONS_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_DECLINED_RESERVATIONS_TIMEOUT: Duration = Duration::ZERO;
const DEFAULT_MAX_FRACTION_USED_THRESHOLD: f64 = 0.95;

const FAILED_RESERVATIONS_TIMEOUT_ENV: &str = "VELA_FAILED_RESERVATION_TIMEOUT_MS";
const DECLINED_RESERVATIONS_TIMEOUT_ENV: &str = "VELA_DECLINED_RESERVATION_TIMEOUT_MS";

/// Construction-time tuning for the store pool.
#[derive(Clone, Copy, Debug)]
pub struct StorePoolConfig {
    /// How long a store may go without an alive gossip before the liveness
    /// worker marks it dead.
    pub time_until_store_dead: Duration,
    /// Throttle applied after a reservation call failed outright.
    pub failed_reservations_timeout: Duration,
    /// Throttle applied after the remote store declined a reservation.
    pub declined_reservations_timeout: Duration,
    /// Stores above this fraction-used are excluded from the snapshot's
    /// rebalance-candidate statistics.
    pub max_fraction_used_threshold: f64,
}

impl Default for StorePoolConfig {
    fn default() -> Self {
        Self {
            time_until_store_dead: DEFAULT_TIME_UNTIL_STORE_DEAD,
            failed_reservations_timeout: DEFAULT_FAILED_RESERVATIONS_TIMEOUT,
            declined_reservations_timeout: DEFAULT_DECLINED_RESERVATIONS_TIMEOUT,
            max_fraction_used_threshold: DEFAULT_MAX_FRACTION_USED_THRESHOLD,
        }
    }
}

impl StorePoolConfig {
    /// Defaults plus environment overrides for the reservation throttles.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(timeout) = env_timeout_ms(FAILED_RESERVATIONS_TIMEOUT_ENV) {
            self.failed_reservations_timeout = timeout;
        }
        if let Some(timeout) = env_timeout_ms(DECLINED_RESERVATIONS_TIMEOUT_ENV) {
            self.declined_reservations_timeout = timeout;
        }
        self
    }
}

fn env_timeout_ms(var_name: &str) -> Option<Duration> {
    let raw = std::env::var(var_name).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(err) => {
            tracing::warn!(var_name, raw, error = ?err, "ignoring unparseable timeout override");
            None
        }
    }
}

/// Running sample count, mean, and variance accumulator.
///
/// Uses Welford's recurrence so long streams stay numerically stable.
/// Callers serialize access.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunningStat {
    n: u64,
    mean: f64,
    s: f64,
}

impl RunningStat {
    pub fn update(&mut self, x: f64) {
        self.n += 1;
        let old_mean = self.mean;
        self.mean += (x - old_mean) / self.n as f64;
        self.s += (x - old_mean) * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.n <= 1 {
            return 0.0;
        }
        self.s / (self.n - 1) as f64
    }
}

/// Filtered snapshot of store descriptors plus aggregate statistics,
/// produced by [`StorePool::store_list`]. Immutable once returned.
#[derive(Clone, Debug)]
pub struct StoreList {
    stores: Vec<StoreDescriptor>,
    count: RunningStat,
    used: RunningStat,
    candidate_count: RunningStat,
    max_fraction_used: f64,
}

impl StoreList {
    /// `max_fraction_used` is allocator configuration: stores above it still
    /// appear in the snapshot but are excluded from `candidate_count`.
    pub fn new(max_fraction_used: f64) -> Self {
        Self {
            stores: Vec::new(),
            count: RunningStat::default(),
            used: RunningStat::default(),
            candidate_count: RunningStat::default(),
            max_fraction_used,
        }
    }

    fn add(&mut self, desc: StoreDescriptor) {
        self.count.update(desc.capacity.range_count as f64);
        self.used.update(desc.capacity.fraction_used());
        if desc.capacity.fraction_used() <= self.max_fraction_used {
            self.candidate_count.update(desc.capacity.range_count as f64);
        }
        self.stores.push(desc);
    }

    pub fn stores(&self) -> &[StoreDescriptor] {
        &self.stores
    }

    /// Range-count statistics over all stores in the snapshot.
    pub fn count(&self) -> RunningStat {
        self.count
    }

    /// Fraction-used statistics over all stores in the snapshot.
    pub fn used(&self) -> RunningStat {
        self.used
    }

    /// Range-count statistics restricted to rebalance candidates.
    pub fn candidate_count(&self) -> RunningStat {
        self.candidate_count
    }
}

impl fmt::Display for StoreList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  candidate-count: mean={:.1}", self.candidate_count.mean())?;
        for desc in &self.stores {
            writeln!(
                f,
                "  {}: range-count={} fraction-used={:.2}",
                desc.store_id,
                desc.capacity.range_count,
                desc.capacity.fraction_used()
            )?;
        }
        Ok(())
    }
}

/// Why a remote store is being throttled from replica placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleReason {
    /// The remote store explicitly declined the reservation.
    Declined,
    /// The reservation exchange failed.
    Failed,
}

/// Eligibility classification of one store against a constraint set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StoreMatch {
    /// Dead, or never observed in gossip.
    Dead,
    /// Alive but its attributes do not satisfy the constraints.
    Alive,
    /// Alive and matched, but throttled by a recent reservation outcome.
    Throttled,
    /// Alive, matched, and eligible to receive a replica.
    Available,
}

/// Policy boundary for matching placement constraints against a store.
pub trait ConstraintMatcher: Send + Sync + 'static {
    fn matches(&self, constraints: &[String], desc: &StoreDescriptor) -> bool;
}

/// Default matcher: every constraint value must appear in the store's
/// combined node+store attribute set. Constraint values are opaque strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllOfMatcher;

impl ConstraintMatcher for AllOfMatcher {
    fn matches(&self, constraints: &[String], desc: &StoreDescriptor) -> bool {
        let combined = desc.combined_attrs();
        let attrs: HashSet<&str> = combined.iter().map(String::as_str).collect();
        constraints.iter().all(|c| attrs.contains(c.as_str()))
    }
}

/// Mutable per-store record owned by the pool.
#[derive(Debug)]
struct StoreDetail {
    /// Latest descriptor seen. Absent until the first descriptor gossip
    /// arrives for a reactively created detail.
    desc: Option<StoreDescriptor>,
    dead: bool,
    times_died: u64,
    found_dead_on: Timestamp,
    /// Most recent alive observation; priority key for the liveness queue.
    last_updated: Timestamp,
    throttled_until: Option<Instant>,
    /// Replicas on this store the cluster has reported dead, by range.
    dead_replicas: HashMap<RangeId, Vec<ReplicaDescriptor>>,
    /// Position in the liveness queue. `None` exactly when dequeued.
    heap_index: Option<usize>,
}

impl StoreDetail {
    fn new() -> Self {
        Self {
            desc: None,
            dead: false,
            times_died: 0,
            found_dead_on: Timestamp::zero(),
            last_updated: Timestamp::zero(),
            throttled_until: None,
            dead_replicas: HashMap::new(),
            heap_index: None,
        }
    }

    fn mark_alive(&mut self, found_alive_on: Timestamp, desc: Option<StoreDescriptor>) {
        if let Some(desc) = desc {
            if self.dead {
                tracing::info!(
                    store_id = desc.store_id,
                    node_id = desc.node.node_id,
                    times_died = self.times_died,
                    down_since_wall_ns = self.found_dead_on.wall_time,
                    "store is back online"
                );
            }
            self.desc = Some(desc);
        }
        self.dead = false;
        self.last_updated = found_alive_on;
    }

    fn mark_dead(&mut self, found_dead_on: Timestamp) {
        self.dead = true;
        self.found_dead_on = found_dead_on;
        self.times_died += 1;
        // desc is still absent when the detail was created reactively and
        // never confirmed by gossip.
        if let Some(desc) = &self.desc {
            tracing::warn!(
                store_id = desc.store_id,
                node_id = desc.node.node_id,
                times_died = self.times_died,
                "store is now considered offline"
            );
        }
    }

    fn classify(
        &self,
        now: Instant,
        constraints: &[String],
        matcher: &dyn ConstraintMatcher,
    ) -> StoreMatch {
        let desc = match &self.desc {
            Some(desc) if !self.dead => desc,
            _ => return StoreMatch::Dead,
        };
        if !matcher.matches(constraints, desc) {
            return StoreMatch::Alive;
        }
        if self.throttled_until.map(|until| until > now).unwrap_or(false) {
            return StoreMatch::Throttled;
        }
        StoreMatch::Available
    }
}

fn queue_key(details: &[StoreDetail], slot: usize) -> Timestamp {
    details[slot].last_updated
}

/// Min-heap of detail arena slots ordered by `last_updated`; the head is the
/// store most overdue for a liveness check.
///
/// Each detail carries its own heap position so a priority change can be
/// fixed in place; every swap keeps the back-pointers in sync. Not
/// independently thread-safe, the pool's lock covers it.
#[derive(Debug, Default)]
struct LivenessQueue {
    heap: Vec<usize>,
}

impl LivenessQueue {
    fn peek(&self) -> Option<usize> {
        self.heap.first().copied()
    }

    /// Insert `slot`, or restore heap order in place if it is already queued
    /// and its priority changed.
    fn enqueue(&mut self, details: &mut [StoreDetail], slot: usize) {
        match details[slot].heap_index {
            Some(pos) => self.fix(details, pos),
            None => {
                let pos = self.heap.len();
                self.heap.push(slot);
                details[slot].heap_index = Some(pos);
                self.sift_up(details, pos);
            }
        }
    }

    fn dequeue(&mut self, details: &mut [StoreDetail]) -> Option<usize> {
        if self.heap.is_empty() {
            return None;
        }
        let slot = self.heap.swap_remove(0);
        details[slot].heap_index = None;
        if !self.heap.is_empty() {
            details[self.heap[0]].heap_index = Some(0);
            self.sift_down(details, 0);
        }
        Some(slot)
    }

    fn fix(&mut self, details: &mut [StoreDetail], pos: usize) {
        if !self.sift_down(details, pos) {
            self.sift_up(details, pos);
        }
    }

    fn sift_up(&mut self, details: &mut [StoreDetail], mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if queue_key(details, self.heap[pos]) >= queue_key(details, self.heap[parent]) {
                break;
            }
            self.swap(details, pos, parent);
            pos = parent;
        }
    }

    /// Returns whether the element moved.
    fn sift_down(&mut self, details: &mut [StoreDetail], mut pos: usize) -> bool {
        let start = pos;
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < self.heap.len()
                && queue_key(details, self.heap[right]) < queue_key(details, self.heap[left])
            {
                child = right;
            }
            if queue_key(details, self.heap[child]) >= queue_key(details, self.heap[pos]) {
                break;
            }
            self.swap(details, pos, child);
            pos = child;
        }
        pos != start
    }

    fn swap(&mut self, details: &mut [StoreDetail], a: usize, b: usize) {
        self.heap.swap(a, b);
        details[self.heap[a]].heap_index = Some(a);
        details[self.heap[b]].heap_index = Some(b);
    }
}

/// Registry state guarded by the pool's single lock.
///
/// Details live in an append-only arena; the id map and the liveness queue
/// both refer to arena slots so the heap can keep its back-pointers in sync
/// without shared ownership.
#[derive(Default)]
struct PoolInner {
    details: Vec<StoreDetail>,
    by_id: HashMap<StoreId, usize>,
    queue: LivenessQueue,
}

impl PoolInner {
    /// Resolve the arena slot for `store_id`, creating the detail on first
    /// mention. A store nothing has told us about yet is presumed alive, and
    /// its liveness clock starts immediately so it ages out naturally if
    /// gossip never confirms it. Callers hold the write lock even when the
    /// net effect is read-only.
    fn get_or_create(&mut self, store_id: StoreId, now: Timestamp) -> usize {
        if let Some(&slot) = self.by_id.get(&store_id) {
            return slot;
        }
        let slot = self.details.len();
        self.details.push(StoreDetail::new());
        self.by_id.insert(store_id, slot);
        self.details[slot].mark_alive(now, None);
        self.queue.enqueue(&mut self.details, slot);
        slot
    }
}

/// Registry of every known store in the cluster and its health.
///
/// Clones share the same underlying pool. Details are never removed: dead
/// stores stay addressable so a later alive gossip can revive them.
#[derive(Clone)]
pub struct StorePool {
    clock: Arc<Clock>,
    config: StorePoolConfig,
    matcher: Arc<dyn ConstraintMatcher>,
    resolver: NodeAddressResolver,
    inner: Arc<RwLock<PoolInner>>,
}

impl StorePool {
    /// Build a pool with the default all-of constraint matcher, register its
    /// gossip callbacks, and start the liveness worker on `stopper`.
    pub fn new(
        gossip: &Arc<Gossip>,
        clock: Arc<Clock>,
        config: StorePoolConfig,
        stopper: &Stopper,
    ) -> Self {
        Self::with_matcher(gossip, clock, config, stopper, Arc::new(AllOfMatcher))
    }

    pub fn with_matcher(
        gossip: &Arc<Gossip>,
        clock: Arc<Clock>,
        config: StorePoolConfig,
        stopper: &Stopper,
        matcher: Arc<dyn ConstraintMatcher>,
    ) -> Self {
        let pool = Self {
            clock,
            config,
            matcher,
            resolver: gossip_address_resolver(gossip.clone()),
            inner: Arc::new(RwLock::new(PoolInner::default())),
        };

        let store_pool = pool.clone();
        gossip.register_callback(STORE_GOSSIP_PREFIX, move |key, payload| {
            store_pool.store_gossip_update(key, payload)
        });
        let dead_pool = pool.clone();
        gossip.register_callback(DEAD_REPLICAS_GOSSIP_PREFIX, move |key, payload| {
            dead_pool.dead_replicas_gossip_update(key, payload)
        });

        pool.start(stopper);
        pool
    }

    /// Resolver for node addresses, backed by the same gossip hub.
    pub fn resolver(&self) -> NodeAddressResolver {
        self.resolver.clone()
    }

    fn store_gossip_update(&self, _key: &str, payload: &[u8]) {
        let desc = match StoreDescriptor::decode(payload) {
            Ok(desc) => desc,
            Err(err) => {
                tracing::error!(error = ?err, "store descriptor gossip decode failed");
                return;
            }
        };
        let store_id = desc.store_id;

        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let slot = inner.get_or_create(store_id, now);
        let inner = &mut *inner;
        inner.details[slot].mark_alive(now, Some(desc));
        inner.queue.enqueue(&mut inner.details, slot);
    }

    fn dead_replicas_gossip_update(&self, _key: &str, payload: &[u8]) {
        let update = match StoreDeadReplicas::decode(payload) {
            Ok(update) => update,
            Err(err) => {
                tracing::error!(error = ?err, "dead replicas gossip decode failed");
                return;
            }
        };

        let mut dead_replicas: HashMap<RangeId, Vec<ReplicaDescriptor>> = HashMap::new();
        for ident in update.replicas {
            dead_replicas
                .entry(ident.range_id)
                .or_default()
                .push(ident.replica);
        }

        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let slot = inner.get_or_create(update.store_id, now);
        // Gossip carries the authoritative current set; replace, never merge.
        inner.details[slot].dead_replicas = dead_replicas;
    }

    /// Spawn the liveness worker: sleep until the queue head can possibly be
    /// overdue, then mark it dead and rearm. No polling.
    fn start(&self, stopper: &Stopper) {
        let pool = self.clone();
        let mut stop_rx = stopper.should_stop();
        stopper.run_worker(async move {
            loop {
                let timeout = pool.next_dead_check_timeout();
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = stop_rx.wait_for(|stopped| *stopped) => return,
                }
            }
        });
    }

    /// Mark the queue head dead if it is overdue and return how long until
    /// the next head can possibly become overdue. Overdue heads are removed
    /// from the queue but stay in the registry.
    fn next_dead_check_timeout(&self) -> Duration {
        let mut inner = self.inner.write().unwrap();
        let Some(slot) = inner.queue.peek() else {
            // No stores yet, wait the full interval.
            return self.config.time_until_store_dead;
        };

        let now = self.clock.now();
        let dead_as_of =
            inner.details[slot].last_updated.wall_duration() + self.config.time_until_store_dead;
        if now.wall_duration() >= dead_as_of {
            let inner = &mut *inner;
            if let Some(dead_slot) = inner.queue.dequeue(&mut inner.details) {
                inner.details[dead_slot].mark_dead(now);
            }
            // The next head may be overdue as well; rearm immediately.
            Duration::ZERO
        } else {
            dead_as_of - now.wall_duration()
        }
    }

    /// Snapshot of the stores matching `constraints` that are currently
    /// eligible to receive a replica, plus how many matching-or-not stores
    /// were alive and how many of the matching ones were throttled.
    ///
    /// `deterministic` sorts by store id and exists for test determinism
    /// only.
    pub fn store_list(
        &self,
        constraints: &[String],
        deterministic: bool,
    ) -> (StoreList, usize, usize) {
        let inner = self.inner.read().unwrap();

        let mut store_ids: Vec<StoreId> = inner.by_id.keys().copied().collect();
        if deterministic {
            store_ids.sort_unstable();
        }

        let now = Instant::now();
        let mut list = StoreList::new(self.config.max_fraction_used_threshold);
        let mut alive_count = 0;
        let mut throttled_count = 0;
        for store_id in store_ids {
            let detail = &inner.details[inner.by_id[&store_id]];
            match detail.classify(now, constraints, self.matcher.as_ref()) {
                StoreMatch::Dead => {}
                StoreMatch::Alive => alive_count += 1,
                StoreMatch::Throttled => {
                    alive_count += 1;
                    throttled_count += 1;
                }
                StoreMatch::Available => {
                    alive_count += 1;
                    if let Some(desc) = &detail.desc {
                        list.add(desc.clone());
                    }
                }
            }
        }
        (list, alive_count, throttled_count)
    }

    /// Latest gossiped descriptor for the store, if one has been seen.
    pub fn store_descriptor(&self, store_id: StoreId) -> Option<StoreDescriptor> {
        let inner = self.inner.read().unwrap();
        inner
            .by_id
            .get(&store_id)
            .and_then(|&slot| inner.details[slot].desc.clone())
    }

    /// Subset of `replicas`, in input order, that live on dead stores or are
    /// listed dead for `range_id`. A dead store shadows the per-range index.
    pub fn dead_replicas(
        &self,
        range_id: RangeId,
        replicas: &[ReplicaDescriptor],
    ) -> Vec<ReplicaDescriptor> {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();

        let mut dead = Vec::new();
        for replica in replicas {
            let slot = inner.get_or_create(replica.store_id, now);
            let detail = &inner.details[slot];
            if detail.dead {
                dead.push(*replica);
                continue;
            }
            let listed_dead = detail
                .dead_replicas
                .get(&range_id)
                .map(|dead| dead.iter().any(|r| r.replica_id == replica.replica_id))
                .unwrap_or(false);
            if listed_dead {
                dead.push(*replica);
            }
        }
        dead
    }

    /// Exclude `store_id` from the available classification until the
    /// configured throttle window passes. Liveness is unaffected.
    pub fn throttle(&self, reason: ThrottleReason, store_id: StoreId) {
        let timeout = match reason {
            ThrottleReason::Declined => self.config.declined_reservations_timeout,
            ThrottleReason::Failed => self.config.failed_reservations_timeout,
        };

        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let slot = inner.get_or_create(store_id, now);
        inner.details[slot].throttled_until = Some(Instant::now() + timeout);
        tracing::debug!(
            store_id,
            reason = ?reason,
            timeout_ms = timeout.as_millis() as u64,
            "store throttled from replica placement"
        );
    }

    /// Patch the local estimate of a remote store's range count after moving
    /// a replica there, without waiting for the next gossip round. Dropped
    /// silently when no descriptor has been seen yet.
    pub fn update_remote_capacity_estimate(&self, store_id: StoreId, capacity: StoreCapacity) {
        let now = self.clock.now();
        let mut inner = self.inner.write().unwrap();
        let slot = inner.get_or_create(store_id, now);
        if let Some(desc) = inner.details[slot].desc.as_mut() {
            desc.capacity.range_count = capacity.range_count;
        }
    }
}

impl fmt::Display for StorePool {
    /// One line per store, sorted by id: id (with `*` when dead), range
    /// count, fraction used, and remaining throttle if positive.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        let mut store_ids: Vec<StoreId> = inner.by_id.keys().copied().collect();
        store_ids.sort_unstable();

        let now = Instant::now();
        for store_id in store_ids {
            let detail = &inner.details[inner.by_id[&store_id]];
            write!(f, "{store_id}")?;
            if detail.dead {
                write!(f, "*")?;
            }
            match &detail.desc {
                Some(desc) => write!(
                    f,
                    ": range-count={} fraction-used={:.2}",
                    desc.capacity.range_count,
                    desc.capacity.fraction_used()
                )?,
                None => write!(f, ": no descriptor")?,
            }
            if let Some(until) = detail.throttled_until {
                let remaining = until.saturating_duration_since(now);
                if !remaining.is_zero() {
                    write!(f, " [throttled={:.1}s]", remaining.as_secs_f64())?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
