//! In-memory store implementations.
//!
//! Every store contract in the crate has a process-local implementation
//! here, driven by an injected [`Clock`](crate::clock::Clock) so tests
//! advance time instead of sleeping. The implementations honor the same
//! invariants the SQL stores do (single claim, stale-owner no-ops, reap
//! idempotence, fencing monotonicity); the contract tests in the server
//! crate run against them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::fanout::{FanoutCursor, FanoutPolicy, FanoutStore};
use crate::id::{CorrelationId, JobId, JoinId, MessageId, OwnerToken, RunId, TimerId};
use crate::inbox::{DedupeKey, InboxRecord, InboxStore, IngestResult, NewInboxEvent};
use crate::lease::{CoarseLeaseGrant, CoarseLeaseStore, FencingToken, LockStore};
use crate::outbox::{
    EnqueueOptions, EnqueueResult, JoinStatus, JoinStore, JoinTransition, OutboxJoin,
    OutboxMessage, OutboxStore, StepStatus,
};
use crate::scheduler::{
    CronJob, JobRun, MaterializeResult, RunStatus, SchedulerStore, Timer,
};
use crate::work_item::{WorkItem, WorkItemStatus, WorkQueue};

// =============================================================================
// Shared queue core
// =============================================================================

/// Access to the embedded work item of a row type.
pub trait Rowed: Send {
    fn item(&self) -> &WorkItem;
    fn item_mut(&mut self) -> &mut WorkItem;
}

impl Rowed for OutboxMessage {
    fn item(&self) -> &WorkItem {
        &self.item
    }
    fn item_mut(&mut self) -> &mut WorkItem {
        &mut self.item
    }
}

impl Rowed for InboxRecord {
    fn item(&self) -> &WorkItem {
        &self.item
    }
    fn item_mut(&mut self) -> &mut WorkItem {
        &mut self.item
    }
}

impl Rowed for JobRun {
    fn item(&self) -> &WorkItem {
        &self.item
    }
    fn item_mut(&mut self) -> &mut WorkItem {
        &mut self.item
    }
}

/// The claim/ack/abandon/fail/reap state machine over a vector of rows.
/// Insertion order is the creation-order tie-break.
pub struct QueueCore<T: Rowed> {
    rows: Mutex<Vec<T>>,
    clock: SharedClock,
}

impl<T: Rowed + Clone> QueueCore<T> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn push(&self, row: T) {
        self.rows.lock().unwrap().push(row);
    }

    pub fn with_rows<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        f(&mut self.rows.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.rows.lock().unwrap().clone()
    }

    pub fn claim(&self, owner: OwnerToken, lease: Duration, batch_size: usize) -> Vec<T> {
        let now = self.now();
        let mut rows = self.rows.lock().unwrap();

        let mut visible: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.item().is_visible_at(now))
            .map(|(i, _)| i)
            .collect();
        // Due-time order, insertion index as the tie-break.
        visible.sort_by_key(|&i| (rows[i].item().due_time_utc, rows[i].item().created_at, i));
        visible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(visible.len());
        for i in visible {
            let item = rows[i].item_mut();
            item.status = WorkItemStatus::Claimed;
            item.owner_token = Some(owner);
            item.locked_until =
                Some(now + chrono::Duration::from_std(lease).unwrap_or_else(|_| {
                    chrono::Duration::seconds(30)
                }));
            claimed.push(rows[i].clone());
        }
        claimed
    }

    pub fn ack(&self, owner: OwnerToken, ids: &[Uuid]) {
        let now = self.now();
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            let item = row.item_mut();
            if ids.contains(&item.id) && item.is_owned_by(owner, now) {
                item.status = WorkItemStatus::Completed;
                item.processed_at = Some(now);
                item.locked_until = None;
                item.owner_token = None;
            }
        }
    }

    pub fn abandon(&self, owner: OwnerToken, ids: &[Uuid], last_error: Option<&str>, delay: Duration) {
        let now = self.now();
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            let item = row.item_mut();
            if ids.contains(&item.id) && item.is_owned_by(owner, now) {
                item.status = WorkItemStatus::FailedRetryable;
                item.retry_count += 1;
                item.last_error = last_error.map(String::from);
                item.due_time_utc = now
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                item.locked_until = None;
                item.owner_token = None;
            }
        }
    }

    pub fn fail(&self, owner: OwnerToken, ids: &[Uuid], error: &str) {
        let now = self.now();
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            let item = row.item_mut();
            if ids.contains(&item.id) && item.is_owned_by(owner, now) {
                item.status = WorkItemStatus::Poisoned;
                item.last_error = Some(error.to_string());
                item.locked_until = None;
                item.owner_token = None;
            }
        }
    }

    pub fn reap_expired(&self) -> u64 {
        let now = self.now();
        let mut rows = self.rows.lock().unwrap();
        let mut reaped = 0;
        for row in rows.iter_mut() {
            let item = row.item_mut();
            if item.is_reapable_at(now) {
                item.status = WorkItemStatus::FailedRetryable;
                item.locked_until = None;
                item.owner_token = None;
                reaped += 1;
            }
        }
        reaped
    }

    pub fn reschedule(&self, owner: OwnerToken, id: Uuid, delay: Duration, last_error: &str) {
        self.abandon(owner, &[id], Some(last_error), delay);
    }

    pub fn replay_poisoned(&self, id: Uuid) -> bool {
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            let item = row.item_mut();
            if item.id == id && item.status == WorkItemStatus::Poisoned {
                item.status = WorkItemStatus::Pending;
                item.retry_count = 0;
                item.last_error = None;
                return true;
            }
        }
        false
    }
}

macro_rules! delegate_work_queue {
    ($type:ty) => {
        #[async_trait]
        impl WorkQueue for $type {
            async fn claim(
                &self,
                owner: OwnerToken,
                lease: Duration,
                batch_size: usize,
            ) -> anyhow::Result<Vec<WorkItem>> {
                Ok(self
                    .core
                    .claim(owner, lease, batch_size)
                    .into_iter()
                    .map(|r| r.item().clone())
                    .collect())
            }

            async fn ack(&self, owner: OwnerToken, ids: &[Uuid]) -> anyhow::Result<()> {
                self.core.ack(owner, ids);
                Ok(())
            }

            async fn abandon(
                &self,
                owner: OwnerToken,
                ids: &[Uuid],
                last_error: Option<&str>,
                delay: Duration,
            ) -> anyhow::Result<()> {
                self.core.abandon(owner, ids, last_error, delay);
                Ok(())
            }

            async fn fail(
                &self,
                owner: OwnerToken,
                ids: &[Uuid],
                error: &str,
            ) -> anyhow::Result<()> {
                self.core.fail(owner, ids, error);
                Ok(())
            }

            async fn reap_expired(&self) -> anyhow::Result<u64> {
                Ok(self.core.reap_expired())
            }

            async fn reschedule(
                &self,
                owner: OwnerToken,
                id: Uuid,
                delay: Duration,
                last_error: &str,
            ) -> anyhow::Result<()> {
                self.core.reschedule(owner, id, delay, last_error);
                Ok(())
            }

            async fn replay_poisoned(&self, id: Uuid) -> anyhow::Result<bool> {
                Ok(self.core.replay_poisoned(id))
            }
        }
    };
}

// =============================================================================
// Outbox
// =============================================================================

/// In-memory outbox with joins.
pub struct InMemoryOutbox {
    core: QueueCore<OutboxMessage>,
    joins: Mutex<HashMap<JoinId, (OutboxJoin, HashMap<MessageId, StepStatus>)>>,
}

impl InMemoryOutbox {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            core: QueueCore::new(clock),
            joins: Mutex::new(HashMap::new()),
        }
    }

    /// All messages, for assertions.
    pub fn snapshot(&self) -> Vec<OutboxMessage> {
        self.core.snapshot()
    }

    /// Messages currently on `topic`, for assertions.
    pub fn on_topic(&self, topic: &str) -> Vec<OutboxMessage> {
        self.snapshot()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

delegate_work_queue!(InMemoryOutbox);

#[async_trait]
impl OutboxStore for InMemoryOutbox {
    async fn enqueue(
        &self,
        topic: &str,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> anyhow::Result<EnqueueResult> {
        let message_id = opts.message_id.unwrap_or_default();
        let now = self.core.now();

        let duplicate = self.core.with_rows(|rows| {
            rows.iter()
                .find(|m| m.message_id == message_id)
                .map(|m| m.message_id)
        });
        if let Some(existing) = duplicate {
            return Ok(EnqueueResult::Duplicate(existing));
        }

        let due = opts.due_time.unwrap_or(now);
        self.core.push(OutboxMessage {
            item: WorkItem::new(Uuid::new_v4(), due, now),
            message_id,
            topic: topic.to_string(),
            payload,
            correlation_id: opts.correlation_id,
            join_id: opts.join_id,
        });
        Ok(EnqueueResult::Created(message_id))
    }

    async fn load(&self, ids: &[Uuid]) -> anyhow::Result<Vec<OutboxMessage>> {
        let mut loaded: Vec<OutboxMessage> = self
            .snapshot()
            .into_iter()
            .filter(|m| ids.contains(&m.item.id))
            .collect();
        loaded.sort_by_key(|m| ids.iter().position(|id| *id == m.item.id));
        Ok(loaded)
    }

    async fn get(&self, message_id: MessageId) -> anyhow::Result<Option<OutboxMessage>> {
        Ok(self
            .snapshot()
            .into_iter()
            .find(|m| m.message_id == message_id))
    }

    async fn sweep_dispatched(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(self.core.with_rows(|rows| {
            let before = rows.len();
            rows.retain(|m| {
                !(m.item.status == WorkItemStatus::Completed
                    && m.item.processed_at.map_or(false, |p| p < older_than))
            });
            (before - rows.len()) as u64
        }))
    }
}

#[async_trait]
impl JoinStore for InMemoryOutbox {
    async fn start_join(
        &self,
        tenant_id: &str,
        expected_steps: i32,
        metadata: serde_json::Value,
    ) -> anyhow::Result<JoinId> {
        anyhow::ensure!(expected_steps > 0, "expected_steps must be positive");
        let join = OutboxJoin {
            join_id: JoinId::new(),
            tenant_id: tenant_id.to_string(),
            expected_steps,
            completed_steps: 0,
            failed_steps: 0,
            status: JoinStatus::Open,
            metadata,
            created_at: self.core.now(),
        };
        let id = join.join_id;
        self.joins
            .lock()
            .unwrap()
            .insert(id, (join, HashMap::new()));
        Ok(id)
    }

    async fn attach_message(&self, join_id: JoinId, message_id: MessageId) -> anyhow::Result<()> {
        let mut joins = self.joins.lock().unwrap();
        let (join, members) = joins
            .get_mut(&join_id)
            .ok_or_else(|| anyhow::anyhow!("unknown join {join_id}"))?;
        anyhow::ensure!(
            join.status == JoinStatus::Open,
            "cannot attach to a terminal join"
        );
        members.insert(message_id, StepStatus::Attached);
        Ok(())
    }

    async fn report_step(
        &self,
        join_id: JoinId,
        message_id: MessageId,
        completed: bool,
    ) -> anyhow::Result<JoinTransition> {
        let mut joins = self.joins.lock().unwrap();
        let (join, members) = joins
            .get_mut(&join_id)
            .ok_or_else(|| anyhow::anyhow!("unknown join {join_id}"))?;
        anyhow::ensure!(
            join.status == JoinStatus::Open,
            "join {join_id} is already terminal"
        );
        let member = members
            .get_mut(&message_id)
            .ok_or_else(|| anyhow::anyhow!("message {message_id} not attached to join"))?;
        anyhow::ensure!(
            *member == StepStatus::Attached,
            "message {message_id} already reported"
        );
        *member = if completed {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };

        let status = join.apply_step(completed);
        Ok(match status {
            JoinStatus::Open => JoinTransition::StillOpen,
            terminal => JoinTransition::Closed {
                status: terminal,
                metadata: join.metadata.clone(),
            },
        })
    }

    async fn get_join(&self, join_id: JoinId) -> anyhow::Result<Option<OutboxJoin>> {
        Ok(self
            .joins
            .lock()
            .unwrap()
            .get(&join_id)
            .map(|(j, _)| j.clone()))
    }
}

// =============================================================================
// Inbox
// =============================================================================

pub struct InMemoryInbox {
    core: QueueCore<InboxRecord>,
}

impl InMemoryInbox {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            core: QueueCore::new(clock),
        }
    }

    pub fn snapshot(&self) -> Vec<InboxRecord> {
        self.core.snapshot()
    }
}

delegate_work_queue!(InMemoryInbox);

#[async_trait]
impl InboxStore for InMemoryInbox {
    async fn ingest(&self, event: NewInboxEvent) -> anyhow::Result<IngestResult> {
        let now = self.core.now();
        let touched = self.core.with_rows(|rows| {
            rows.iter_mut()
                .find(|r| {
                    r.source == event.dedupe_key.source && r.message_id == event.dedupe_key.message_id
                })
                .map(|r| {
                    r.last_seen_utc = now;
                    r.item.id
                })
        });
        if let Some(id) = touched {
            return Ok(IngestResult::DuplicateSeen(id));
        }

        let id = Uuid::new_v4();
        self.core.push(InboxRecord {
            item: WorkItem::new(id, now, now),
            source: event.dedupe_key.source,
            message_id: event.dedupe_key.message_id,
            event_type: event.event_type,
            hash: event.body_hash,
            payload: event.payload,
            headers: event.headers,
            first_seen_utc: now,
            last_seen_utc: now,
            processed_utc: None,
            attempts: 0,
        });
        Ok(IngestResult::Stored(id))
    }

    async fn load(&self, ids: &[Uuid]) -> anyhow::Result<Vec<InboxRecord>> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|r| ids.contains(&r.item.id))
            .collect())
    }

    async fn get_by_key(&self, key: &DedupeKey) -> anyhow::Result<Option<InboxRecord>> {
        Ok(self
            .snapshot()
            .into_iter()
            .find(|r| r.source == key.source && r.message_id == key.message_id))
    }

    async fn stuck_count(&self, older_than: DateTime<Utc>) -> anyhow::Result<u64> {
        Ok(self
            .snapshot()
            .iter()
            .filter(|r| !r.item.status.is_terminal() && r.first_seen_utc < older_than)
            .count() as u64)
    }
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct InMemoryScheduler {
    core: QueueCore<JobRun>,
    jobs: Mutex<HashMap<JobId, CronJob>>,
    timers: Mutex<Vec<Timer>>,
}

impl InMemoryScheduler {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            core: QueueCore::new(clock),
            jobs: Mutex::new(HashMap::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn runs_snapshot(&self) -> Vec<JobRun> {
        self.core.snapshot()
    }
}

delegate_work_queue!(InMemoryScheduler);

#[async_trait]
impl SchedulerStore for InMemoryScheduler {
    async fn upsert_job(&self, job: CronJob) -> anyhow::Result<JobId> {
        let mut jobs = self.jobs.lock().unwrap();
        // job_name carries the unique index; an upsert by name keeps the
        // existing id.
        if let Some(existing) = jobs.values().find(|j| j.job_name == job.job_name) {
            let id = existing.job_id;
            let mut replacement = job;
            replacement.job_id = id;
            jobs.insert(id, replacement);
            return Ok(id);
        }
        let id = job.job_id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn set_job_enabled(&self, job_id: JobId, enabled: bool) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("unknown job {job_id}"))?;
        job.is_enabled = enabled;
        Ok(())
    }

    async fn list_enabled_jobs(&self) -> anyhow::Result<Vec<CronJob>> {
        let mut jobs: Vec<CronJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.is_enabled)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(jobs)
    }

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<CronJob>> {
        Ok(self.jobs.lock().unwrap().get(&job_id).cloned())
    }

    async fn update_next_due(&self, job_id: JobId, next: DateTime<Utc>) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("unknown job {job_id}"))?;
        job.next_due_time = Some(next);
        Ok(())
    }

    async fn due_jobs(&self) -> anyhow::Result<Vec<CronJob>> {
        let now = self.core.now();
        let mut due: Vec<CronJob> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.is_enabled && j.next_due_time.map_or(false, |t| t <= now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        Ok(due)
    }

    async fn record_run_outcome(
        &self,
        job_id: JobId,
        ran_at: DateTime<Utc>,
        status: RunStatus,
    ) -> anyhow::Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow::anyhow!("unknown job {job_id}"))?;
        job.last_run_time = Some(ran_at);
        job.last_run_status = Some(status);
        Ok(())
    }

    async fn materialize_run(
        &self,
        job_id: JobId,
        scheduled_time: DateTime<Utc>,
    ) -> anyhow::Result<MaterializeResult> {
        let now = self.core.now();
        let exists = self.core.with_rows(|rows| {
            rows.iter()
                .any(|r| r.job_id == job_id && r.scheduled_time == scheduled_time)
        });
        if exists {
            return Ok(MaterializeResult::AlreadyExists);
        }
        let run_id = RunId::new();
        self.core.push(JobRun {
            item: WorkItem::new(Uuid::new_v4(), scheduled_time, now),
            run_id,
            job_id,
            scheduled_time,
            start_time: None,
            end_time: None,
            output: None,
        });
        Ok(MaterializeResult::Created(run_id))
    }

    async fn load_runs(&self, ids: &[Uuid]) -> anyhow::Result<Vec<JobRun>> {
        Ok(self
            .runs_snapshot()
            .into_iter()
            .filter(|r| ids.contains(&r.item.id))
            .collect())
    }

    async fn runs_for_job(&self, job_id: JobId) -> anyhow::Result<Vec<JobRun>> {
        Ok(self
            .runs_snapshot()
            .into_iter()
            .filter(|r| r.job_id == job_id)
            .collect())
    }

    async fn create_timer(
        &self,
        due_time: DateTime<Utc>,
        topic: &str,
        payload: serde_json::Value,
        correlation_id: CorrelationId,
    ) -> anyhow::Result<TimerId> {
        let now = self.core.now();
        let timer_id = TimerId::new();
        self.timers.lock().unwrap().push(Timer {
            item: WorkItem::new(Uuid::new_v4(), due_time, now),
            timer_id,
            due_time,
            topic: topic.to_string(),
            payload,
            correlation_id,
        });
        Ok(timer_id)
    }

    async fn due_timers(&self, limit: usize) -> anyhow::Result<Vec<Timer>> {
        let now = self.core.now();
        let mut due: Vec<Timer> = self
            .timers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.item.status == WorkItemStatus::Pending && t.due_time <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn complete_timer(&self, timer_id: TimerId) -> anyhow::Result<()> {
        let now = self.core.now();
        let mut timers = self.timers.lock().unwrap();
        let timer = timers
            .iter_mut()
            .find(|t| t.timer_id == timer_id)
            .ok_or_else(|| anyhow::anyhow!("unknown timer {timer_id}"))?;
        timer.item.status = WorkItemStatus::Completed;
        timer.item.processed_at = Some(now);
        Ok(())
    }
}

// =============================================================================
// Fanout
// =============================================================================

pub struct InMemoryFanout {
    policies: Mutex<HashMap<String, FanoutPolicy>>,
    shards: Mutex<HashMap<String, Vec<String>>>,
    cursors: Mutex<HashMap<(String, String), Option<DateTime<Utc>>>>,
}

impl InMemoryFanout {
    pub fn new() -> Self {
        Self {
            policies: Mutex::new(HashMap::new()),
            shards: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_shards(&self, fanout_topic: &str, shards: Vec<String>) {
        self.shards
            .lock()
            .unwrap()
            .insert(fanout_topic.to_string(), shards);
    }
}

impl Default for InMemoryFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutStore for InMemoryFanout {
    async fn list_policies(&self) -> anyhow::Result<Vec<FanoutPolicy>> {
        let mut policies: Vec<FanoutPolicy> =
            self.policies.lock().unwrap().values().cloned().collect();
        policies.sort_by(|a, b| a.fanout_topic.cmp(&b.fanout_topic));
        Ok(policies)
    }

    async fn upsert_policy(&self, policy: FanoutPolicy) -> anyhow::Result<()> {
        self.policies
            .lock()
            .unwrap()
            .insert(policy.fanout_topic.clone(), policy);
        Ok(())
    }

    async fn shards(&self, fanout_topic: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .shards
            .lock()
            .unwrap()
            .get(fanout_topic)
            .cloned()
            .unwrap_or_default())
    }

    async fn register_shard(&self, fanout_topic: &str, shard_key: &str) -> anyhow::Result<()> {
        let mut shards = self.shards.lock().unwrap();
        let entry = shards.entry(fanout_topic.to_string()).or_default();
        if !entry.iter().any(|s| s == shard_key) {
            entry.push(shard_key.to_string());
        }
        Ok(())
    }

    async fn cursor(&self, fanout_topic: &str, shard_key: &str) -> anyhow::Result<FanoutCursor> {
        let last = self
            .cursors
            .lock()
            .unwrap()
            .get(&(fanout_topic.to_string(), shard_key.to_string()))
            .copied()
            .flatten();
        Ok(FanoutCursor {
            fanout_topic: fanout_topic.to_string(),
            shard_key: shard_key.to_string(),
            last_emitted_window_start: last,
        })
    }

    async fn advance_cursor(
        &self,
        fanout_topic: &str,
        shard_key: &str,
        expected_previous: Option<DateTime<Utc>>,
        new_window_start: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut cursors = self.cursors.lock().unwrap();
        let key = (fanout_topic.to_string(), shard_key.to_string());
        let current = cursors.get(&key).copied().flatten();
        if current != expected_previous {
            return Ok(false);
        }
        cursors.insert(key, Some(new_window_start));
        Ok(true)
    }
}

// =============================================================================
// Leases and locks
// =============================================================================

struct CoarseRow {
    owner: String,
    until: DateTime<Utc>,
}

struct LockRow {
    owner: OwnerToken,
    until: DateTime<Utc>,
}

/// In-memory coarse leases plus fine-grained locks with fencing.
pub struct InMemoryLeases {
    clock: SharedClock,
    coarse: Mutex<HashMap<String, CoarseRow>>,
    locks: Mutex<HashMap<String, LockRow>>,
    /// Per-resource counters survive release so tokens never regress.
    counters: Mutex<HashMap<String, i64>>,
    /// Renew failures injected by partition tests.
    fail_renews: std::sync::atomic::AtomicBool,
}

impl InMemoryLeases {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            coarse: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            fail_renews: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Make subsequent renewals fail, simulating a partition from the store.
    pub fn set_fail_renews(&self, fail: bool) {
        self.fail_renews
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    fn next_token(&self, resource: &str) -> FencingToken {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(resource.to_string()).or_insert(0);
        *counter += 1;
        FencingToken(*counter)
    }
}

#[async_trait]
impl CoarseLeaseStore for InMemoryLeases {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        duration: Duration,
    ) -> anyhow::Result<CoarseLeaseGrant> {
        let now = self.clock.now();
        let until = now + chrono::Duration::from_std(duration)?;
        let mut coarse = self.coarse.lock().unwrap();
        let granted = match coarse.get(name) {
            Some(row) if row.until > now && row.owner != owner => false,
            _ => {
                coarse.insert(
                    name.to_string(),
                    CoarseRow {
                        owner: owner.to_string(),
                        until,
                    },
                );
                true
            }
        };
        Ok(CoarseLeaseGrant {
            acquired: granted,
            server_now: now,
            lease_until: until,
        })
    }

    async fn renew(&self, name: &str, owner: &str, duration: Duration) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let mut coarse = self.coarse.lock().unwrap();
        match coarse.get_mut(name) {
            Some(row) if row.owner == owner && row.until > now => {
                row.until = now + chrono::Duration::from_std(duration)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> anyhow::Result<()> {
        let mut coarse = self.coarse.lock().unwrap();
        if coarse.get(name).map_or(false, |row| row.owner == owner) {
            coarse.remove(name);
        }
        Ok(())
    }
}

#[async_trait]
impl LockStore for InMemoryLeases {
    async fn acquire(
        &self,
        resource: &str,
        owner: OwnerToken,
        duration: Duration,
        _context: Option<serde_json::Value>,
    ) -> anyhow::Result<Option<FencingToken>> {
        let now = self.clock.now();
        let until = now + chrono::Duration::from_std(duration)?;
        let mut locks = self.locks.lock().unwrap();
        match locks.get(resource) {
            Some(row) if row.until > now && row.owner != owner => Ok(None),
            _ => {
                locks.insert(resource.to_string(), LockRow { owner, until });
                Ok(Some(self.next_token(resource)))
            }
        }
    }

    async fn renew(
        &self,
        resource: &str,
        owner: OwnerToken,
        duration: Duration,
    ) -> anyhow::Result<Option<FencingToken>> {
        if self.fail_renews.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("injected renew failure");
        }
        let now = self.clock.now();
        let mut locks = self.locks.lock().unwrap();
        match locks.get_mut(resource) {
            Some(row) if row.owner == owner && row.until > now => {
                row.until = now + chrono::Duration::from_std(duration)?;
                Ok(Some(self.next_token(resource)))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, resource: &str, owner: OwnerToken) -> anyhow::Result<()> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(resource).map_or(false, |row| row.owner == owner) {
            locks.remove(resource);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn manual() -> (ManualClock, SharedClock) {
        let clock = ManualClock::start_now();
        let shared: SharedClock = Arc::new(clock.clone());
        (clock, shared)
    }

    #[tokio::test]
    async fn claim_is_exclusive_between_owners() {
        let (_, clock) = manual();
        let outbox = InMemoryOutbox::new(clock);
        outbox
            .enqueue("t", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let a = outbox
            .claim(OwnerToken::new(), Duration::from_secs(30), 10)
            .await
            .unwrap();
        let b = outbox
            .claim(OwnerToken::new(), Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn stale_owner_ack_is_noop() {
        let (clock, shared) = manual();
        let outbox = InMemoryOutbox::new(shared);
        outbox
            .enqueue("t", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();

        let owner = OwnerToken::new();
        let claimed = outbox
            .claim(owner, Duration::from_secs(10), 1)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(11));

        outbox.ack(owner, &[claimed[0].id]).await.unwrap();
        let row = &outbox.snapshot()[0];
        assert_eq!(row.item.status, WorkItemStatus::Claimed);
        assert!(row.item.processed_at.is_none());
    }

    #[tokio::test]
    async fn reap_is_idempotent() {
        let (clock, shared) = manual();
        let outbox = InMemoryOutbox::new(shared);
        outbox
            .enqueue("t", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap();
        outbox
            .claim(OwnerToken::new(), Duration::from_secs(5), 1)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(6));

        assert_eq!(outbox.reap_expired().await.unwrap(), 1);
        let after_first = outbox.snapshot();
        assert_eq!(outbox.reap_expired().await.unwrap(), 0);
        let after_second = outbox.snapshot();
        assert_eq!(
            after_first[0].item.status,
            after_second[0].item.status
        );
        assert_eq!(after_first[0].item.retry_count, after_second[0].item.retry_count);
    }

    #[tokio::test]
    async fn claim_order_is_due_then_insertion() {
        let (clock, shared) = manual();
        let outbox = InMemoryOutbox::new(shared);
        let now = clock.now();

        // Inserted out of due order; the later-due row first.
        outbox
            .enqueue(
                "t",
                serde_json::json!({"n": 2}),
                EnqueueOptions {
                    due_time: Some(now + chrono::Duration::seconds(5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        outbox
            .enqueue("t", serde_json::json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        outbox
            .enqueue("t", serde_json::json!({"n": 3}), EnqueueOptions::default())
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(10));
        let claimed = outbox
            .claim(OwnerToken::new(), Duration::from_secs(30), 10)
            .await
            .unwrap();
        let loaded = outbox
            .load(&claimed.iter().map(|i| i.id).collect::<Vec<_>>())
            .await
            .unwrap();
        let ns: Vec<i64> = loaded
            .iter()
            .map(|m| m.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 3, 2]);
    }

    #[tokio::test]
    async fn duplicate_message_id_is_reported() {
        let (_, clock) = manual();
        let outbox = InMemoryOutbox::new(clock);
        let id = MessageId::new();
        let first = outbox
            .enqueue(
                "t",
                serde_json::json!({}),
                EnqueueOptions::with_message_id(id),
            )
            .await
            .unwrap();
        let second = outbox
            .enqueue(
                "t",
                serde_json::json!({}),
                EnqueueOptions::with_message_id(id),
            )
            .await
            .unwrap();
        assert!(first.is_created());
        assert_eq!(second, EnqueueResult::Duplicate(id));
        assert_eq!(outbox.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn inbox_dedupe_updates_last_seen() {
        let (clock, shared) = manual();
        let inbox = InMemoryInbox::new(shared);
        let key = DedupeKey::from_event_id("stripe", "evt-1");
        let event = NewInboxEvent::new(
            key.clone(),
            "invoice.paid",
            serde_json::json!({}),
            serde_json::json!({}),
            b"body",
        );

        let first = inbox.ingest(event.clone()).await.unwrap();
        clock.advance(chrono::Duration::seconds(30));
        let second = inbox.ingest(event).await.unwrap();

        assert!(matches!(first, IngestResult::Stored(_)));
        assert!(matches!(second, IngestResult::DuplicateSeen(_)));
        assert_eq!(first.row_id(), second.row_id());

        let rows = inbox.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_seen_utc - rows[0].first_seen_utc, chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn scheduler_materializes_at_most_one_run() {
        let (_, clock) = manual();
        let scheduler = InMemoryScheduler::new(clock);
        let job_id = JobId::new();
        let at = Utc::now();

        let first = scheduler.materialize_run(job_id, at).await.unwrap();
        let second = scheduler.materialize_run(job_id, at).await.unwrap();
        assert!(matches!(first, MaterializeResult::Created(_)));
        assert_eq!(second, MaterializeResult::AlreadyExists);
        assert_eq!(scheduler.runs_for_job(job_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_tokens_are_strictly_increasing_across_holders() {
        let (clock, shared) = manual();
        let leases = InMemoryLeases::new(shared);

        let first_owner = OwnerToken::new();
        let t1 = LockStore::acquire(&leases, "resourceA", first_owner, Duration::from_secs(10), None)
            .await
            .unwrap()
            .unwrap();

        // Second owner cannot take a live lock.
        let blocked =
            LockStore::acquire(&leases, "resourceA", OwnerToken::new(), Duration::from_secs(10), None)
                .await
                .unwrap();
        assert!(blocked.is_none());

        // After expiry another owner acquires and the token advances.
        clock.advance(chrono::Duration::seconds(11));
        let t2 = LockStore::acquire(&leases, "resourceA", OwnerToken::new(), Duration::from_secs(10), None)
            .await
            .unwrap()
            .unwrap();
        assert!(t2 > t1);

        // The first owner's renew now fails: its lease is gone.
        let renewed = LockStore::renew(&leases, "resourceA", first_owner, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(renewed.is_none());
    }

    #[tokio::test]
    async fn fanout_cursor_compare_and_set() {
        let fanout = InMemoryFanout::new();
        let now = Utc::now();
        assert!(fanout
            .advance_cursor("billing", "s0", None, now)
            .await
            .unwrap());
        // Stale expected-previous loses the race.
        assert!(!fanout
            .advance_cursor("billing", "s0", None, now + chrono::Duration::minutes(5))
            .await
            .unwrap());
        assert!(fanout
            .advance_cursor("billing", "s0", Some(now), now + chrono::Duration::minutes(5))
            .await
            .unwrap());
    }
}
