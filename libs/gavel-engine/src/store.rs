/// Result Store and Notifier
///
/// Every transition is one whole-record compare-and-swap on `revision`, so a
/// reader sees either the previous state or the new one, never a terminal
/// status without the results it was computed from.
///
/// `Ledger` layers the lifecycle rules (monotonic status, terminal records are
/// frozen) and event publication on top of any [`ResultStore`] backend.

use async_trait::async_trait;
use chrono::Utc;
use gavel_common::error::{JudgeError, JudgeResult};
use gavel_common::types::{
    ExecutionResult, StatusEvent, StatusSnapshot, SubmissionListing, SubmissionRecord,
    SubmissionStatus, Summary,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const MAX_SWAP_ATTEMPTS: usize = 16;

pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;
pub const MAX_PAGE: usize = 100_000;

/// Persistence backend for submission records
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store a new record; fails if the id is already taken
    async fn insert(&self, record: &SubmissionRecord) -> JudgeResult<()>;

    async fn load(&self, id: Uuid) -> JudgeResult<Option<SubmissionRecord>>;

    /// Replace the record if its stored revision equals `expected_revision`
    async fn swap(&self, expected_revision: u64, record: &SubmissionRecord) -> JudgeResult<bool>;

    /// Records of one owner, or of every owner when `owner` is None
    async fn list(&self, owner: Option<&str>) -> JudgeResult<Vec<SubmissionRecord>>;
}

fn lock_poisoned<T>(_: T) -> JudgeError {
    JudgeError::Store("store lock poisoned".to_string())
}

/// In-process store. Each record has its own lock; the map lock is only held
/// to find the record.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, Arc<Mutex<SubmissionRecord>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: Uuid) -> JudgeResult<Option<Arc<Mutex<SubmissionRecord>>>> {
        let records = self.records.read().map_err(lock_poisoned)?;
        Ok(records.get(&id).cloned())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert(&self, record: &SubmissionRecord) -> JudgeResult<()> {
        let mut records = self.records.write().map_err(lock_poisoned)?;
        if records.contains_key(&record.id) {
            return Err(JudgeError::Store(format!(
                "submission {} already exists",
                record.id
            )));
        }
        records.insert(record.id, Arc::new(Mutex::new(record.clone())));
        Ok(())
    }

    async fn load(&self, id: Uuid) -> JudgeResult<Option<SubmissionRecord>> {
        match self.entry(id)? {
            Some(entry) => Ok(Some(entry.lock().map_err(lock_poisoned)?.clone())),
            None => Ok(None),
        }
    }

    async fn swap(&self, expected_revision: u64, record: &SubmissionRecord) -> JudgeResult<bool> {
        let Some(entry) = self.entry(record.id)? else {
            return Ok(false);
        };
        let mut current = entry.lock().map_err(lock_poisoned)?;
        if current.revision != expected_revision {
            return Ok(false);
        }
        *current = record.clone();
        Ok(true)
    }

    async fn list(&self, owner: Option<&str>) -> JudgeResult<Vec<SubmissionRecord>> {
        let entries: Vec<_> = {
            let records = self.records.read().map_err(lock_poisoned)?;
            records.values().cloned().collect()
        };

        let mut owned = Vec::new();
        for entry in entries {
            let record = entry.lock().map_err(lock_poisoned)?;
            if owner.map_or(true, |o| record.owner.as_deref() == Some(o)) {
                owned.push(record.clone());
            }
        }
        Ok(owned)
    }
}

/// Redis-backed store, one JSON value per submission with a TTL
#[derive(Clone)]
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
    ttl_secs: u64,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> JudgeResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn, ttl_secs })
    }

    pub fn new(conn: redis::aio::ConnectionManager, ttl_secs: u64) -> Self {
        Self { conn, ttl_secs }
    }
}

#[async_trait]
impl ResultStore for RedisStore {
    async fn insert(&self, record: &SubmissionRecord) -> JudgeResult<()> {
        let mut conn = self.conn.clone();
        let inserted =
            gavel_common::redis::insert_record(&mut conn, record, self.ttl_secs).await?;
        if !inserted {
            return Err(JudgeError::Store(format!(
                "submission {} already exists",
                record.id
            )));
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> JudgeResult<Option<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        Ok(gavel_common::redis::load_record(&mut conn, &id).await?)
    }

    async fn swap(&self, expected_revision: u64, record: &SubmissionRecord) -> JudgeResult<bool> {
        let mut conn = self.conn.clone();
        Ok(
            gavel_common::redis::swap_record(&mut conn, expected_revision, record, self.ttl_secs)
                .await?,
        )
    }

    async fn list(&self, owner: Option<&str>) -> JudgeResult<Vec<SubmissionRecord>> {
        let mut conn = self.conn.clone();
        let ids = gavel_common::redis::submission_ids(&mut conn, owner).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            // Index entries can outlive expired records
            if let Some(record) = gavel_common::redis::load_record(&mut conn, &id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Listing query; `owner: None` spans every submitter
#[derive(Debug, Clone)]
pub struct ListFilter {
    pub owner: Option<String>,
    pub exercise_id: Option<String>,
    pub status: Option<SubmissionStatus>,
    pub page: usize,
    pub limit: usize,
}

impl ListFilter {
    pub fn for_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Self::everyone()
        }
    }

    pub fn everyone() -> Self {
        Self {
            owner: None,
            exercise_id: None,
            status: None,
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Lifecycle-aware facade over a store backend, publishing status events
pub struct Ledger {
    store: Arc<dyn ResultStore>,
    events: broadcast::Sender<StatusEvent>,
}

impl Ledger {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { store, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    fn publish(&self, record: &SubmissionRecord) {
        // No subscribers is not an error
        let _ = self.events.send(StatusEvent {
            submission_id: record.id,
            status: record.status,
            current_test: record.current_test,
        });
    }

    pub async fn create(&self, record: &SubmissionRecord) -> JudgeResult<()> {
        self.store.insert(record).await?;
        self.publish(record);
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> JudgeResult<Option<SubmissionRecord>> {
        self.store.load(id).await
    }

    pub async fn snapshot(&self, id: Uuid) -> JudgeResult<StatusSnapshot> {
        self.get(id)
            .await?
            .map(|r| r.snapshot())
            .ok_or(JudgeError::NotFound(id))
    }

    /// Apply `mutate` to the latest record and swap it in atomically.
    ///
    /// Returns `Ok(None)` when the mutation declines (returns false) or would
    /// break the lifecycle: terminal records are never modified and status
    /// only moves forward.
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> JudgeResult<Option<SubmissionRecord>>
    where
        F: Fn(&mut SubmissionRecord) -> bool + Send + Sync,
    {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let current = self.get(id).await?.ok_or(JudgeError::NotFound(id))?;
            if current.status.is_terminal() {
                return Ok(None);
            }

            let mut next = current.clone();
            if !mutate(&mut next) {
                return Ok(None);
            }
            if next.status != current.status && !current.status.can_transition_to(next.status) {
                warn!(
                    submission_id = %id,
                    from = %current.status,
                    to = %next.status,
                    "Rejected non-monotonic status transition"
                );
                return Ok(None);
            }

            next.revision = current.revision + 1;
            next.updated_at = Utc::now();

            if self.store.swap(current.revision, &next).await? {
                if next.status != current.status || next.current_test != current.current_test {
                    self.publish(&next);
                }
                return Ok(Some(next));
            }
            debug!(submission_id = %id, "Concurrent update, retrying");
        }

        Err(JudgeError::Store(format!(
            "submission {} is under heavy contention",
            id
        )))
    }

    /// Claim a queued submission for execution. False if it was cancelled first.
    pub async fn begin(&self, id: Uuid) -> JudgeResult<bool> {
        let updated = self
            .update(id, |r| {
                if r.status != SubmissionStatus::Pending {
                    return false;
                }
                r.status = SubmissionStatus::Compiling;
                true
            })
            .await?;
        Ok(updated.is_some())
    }

    pub async fn mark_running(&self, id: Uuid, test: usize) -> JudgeResult<bool> {
        let updated = self
            .update(id, |r| {
                r.status = SubmissionStatus::Running;
                r.current_test = Some(test);
                true
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Append the next result; results only ever grow in test order
    pub async fn append_result(&self, id: Uuid, result: &ExecutionResult) -> JudgeResult<bool> {
        let updated = self
            .update(id, |r| {
                if result.test != r.results.len() + 1 {
                    return false;
                }
                r.results.push(result.clone());
                r.execution_time_ms += result.execution_time_ms;
                true
            })
            .await?;
        Ok(updated.is_some())
    }

    /// Store the terminal state. Returns the frozen record, or None if already terminal.
    pub async fn finish(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        summary: Summary,
        compile_output: Option<String>,
        results: Option<Vec<ExecutionResult>>,
    ) -> JudgeResult<Option<SubmissionRecord>> {
        self.update(id, |r| {
            r.status = status;
            r.current_test = None;
            if let Some(results) = &results {
                r.execution_time_ms = results.iter().map(|x| x.execution_time_ms).sum();
                r.results = results.clone();
            }
            r.summary = Some(summary);
            r.compile_output = compile_output.clone();
            true
        })
        .await
    }

    /// Cancel a submission that no worker has claimed yet
    pub async fn cancel_pending(&self, id: Uuid) -> JudgeResult<Option<SubmissionRecord>> {
        self.update(id, |r| {
            if r.status != SubmissionStatus::Pending {
                return false;
            }
            r.status = SubmissionStatus::Cancelled;
            r.summary = Some(Summary::from_results(&[]));
            true
        })
        .await
    }

    /// Resolve once the submission reaches a terminal state
    pub async fn wait_terminal(&self, id: Uuid) -> JudgeResult<StatusSnapshot> {
        // Subscribe before the first read so no transition can slip between them
        let mut events = self.subscribe();
        loop {
            let snapshot = self.snapshot(id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.submission_id == id && event.status.is_terminal() => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(JudgeError::Internal("event channel closed".to_string()))
                    }
                }
            }
        }
    }

    /// Submissions matching `filter`, newest first, paginated
    pub async fn list(&self, filter: &ListFilter) -> JudgeResult<Vec<SubmissionListing>> {
        let mut records = self.store.list(filter.owner.as_deref()).await?;
        records.retain(|r| {
            filter
                .exercise_id
                .as_ref()
                .map_or(true, |e| r.exercise_id.as_ref() == Some(e))
                && filter.status.map_or(true, |s| r.status == s)
        });
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let limit = filter.limit.clamp(1, MAX_PAGE_LIMIT);
        // Pages past the end are empty, however far past
        let offset = filter.page.max(1).saturating_sub(1).saturating_mul(limit);
        Ok(records
            .iter()
            .skip(offset)
            .take(limit)
            .map(|r| r.listing())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_common::types::{Limits, TestCase, TestStatus};

    fn record(owner: &str, exercise: &str) -> SubmissionRecord {
        SubmissionRecord::new(
            Uuid::new_v4(),
            Some(owner.to_string()),
            Some(exercise.to_string()),
            "python".to_string(),
            "print(1)".to_string(),
            Limits {
                time_limit_secs: 1,
                memory_limit_mb: 64,
            },
            vec![TestCase {
                input: String::new(),
                expected_output: "1".to_string(),
                description: None,
            }],
        )
    }

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()))
    }

    fn accepted(test: usize) -> ExecutionResult {
        ExecutionResult {
            test,
            status: TestStatus::Accepted,
            output: "1".to_string(),
            output_truncated: false,
            execution_time_ms: 12,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_swap_checks_revision() {
        let store = MemoryStore::new();
        let mut rec = record("alice", "sum");
        store.insert(&rec).await.unwrap();
        assert!(store.insert(&rec).await.is_err());

        rec.revision = 1;
        assert!(store.swap(0, &rec).await.unwrap());
        assert!(!store.swap(0, &rec).await.unwrap());
        assert_eq!(store.load(rec.id).await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_and_events() {
        let ledger = ledger();
        let rec = record("alice", "sum");
        let id = rec.id;
        ledger.create(&rec).await.unwrap();
        let mut events = ledger.subscribe();

        assert!(ledger.begin(id).await.unwrap());
        assert!(ledger.mark_running(id, 1).await.unwrap());
        assert!(ledger.append_result(id, &accepted(1)).await.unwrap());
        let done = ledger
            .finish(
                id,
                SubmissionStatus::Accepted,
                Summary::from_results(&[accepted(1)]),
                None,
                None,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(done.status, SubmissionStatus::Accepted);
        assert_eq!(done.execution_time_ms, 12);
        assert_eq!(done.revision, 4);
        assert_eq!(events.recv().await.unwrap().status, SubmissionStatus::Compiling);
        assert_eq!(events.recv().await.unwrap().current_test, Some(1));
        assert_eq!(events.recv().await.unwrap().status, SubmissionStatus::Accepted);
    }

    #[tokio::test]
    async fn test_terminal_record_is_frozen() {
        let ledger = ledger();
        let rec = record("alice", "sum");
        let id = rec.id;
        ledger.create(&rec).await.unwrap();
        assert!(ledger.cancel_pending(id).await.unwrap().is_some());

        assert!(!ledger.begin(id).await.unwrap());
        assert!(!ledger.append_result(id, &accepted(1)).await.unwrap());
        let first = ledger.snapshot(id).await.unwrap();
        let second = ledger.snapshot(id).await.unwrap();
        assert_eq!(first.status, SubmissionStatus::Cancelled);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_backward_transition_rejected() {
        let ledger = ledger();
        let rec = record("alice", "sum");
        let id = rec.id;
        ledger.create(&rec).await.unwrap();
        ledger.mark_running(id, 1).await.unwrap();

        let rejected = ledger
            .update(id, |r| {
                r.status = SubmissionStatus::Compiling;
                true
            })
            .await
            .unwrap();
        assert!(rejected.is_none());
    }

    #[tokio::test]
    async fn test_results_append_in_order_only() {
        let ledger = ledger();
        let rec = record("alice", "sum");
        ledger.create(&rec).await.unwrap();
        assert!(!ledger.append_result(rec.id, &accepted(2)).await.unwrap());
        assert!(ledger.append_result(rec.id, &accepted(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_terminal_resolves_on_finish() {
        let ledger = Arc::new(ledger());
        let rec = record("alice", "sum");
        let id = rec.id;
        ledger.create(&rec).await.unwrap();

        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.wait_terminal(id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        ledger
            .finish(id, SubmissionStatus::WrongAnswer, Summary::from_results(&[]), None, Some(vec![]))
            .await
            .unwrap();

        let snapshot = waiter.await.unwrap().unwrap();
        assert_eq!(snapshot.status, SubmissionStatus::WrongAnswer);
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates() {
        let ledger = ledger();
        for i in 0..5 {
            let exercise = if i % 2 == 0 { "sum" } else { "max" };
            ledger.create(&record("alice", exercise)).await.unwrap();
        }
        ledger.create(&record("bob", "sum")).await.unwrap();

        let all = ledger.list(&ListFilter::for_owner("alice")).await.unwrap();
        assert_eq!(all.len(), 5);
        assert!(all.windows(2).all(|w| w[0].created_at >= w[1].created_at));

        let mut filter = ListFilter::for_owner("alice");
        filter.exercise_id = Some("sum".to_string());
        assert_eq!(ledger.list(&filter).await.unwrap().len(), 3);

        let mut filter = ListFilter::for_owner("alice");
        filter.limit = 2;
        filter.page = 3;
        assert_eq!(ledger.list(&filter).await.unwrap().len(), 1);

        filter.status = Some(SubmissionStatus::Accepted);
        assert!(ledger.list(&filter).await.unwrap().is_empty());

        let everyone = ledger.list(&ListFilter::everyone()).await.unwrap();
        assert_eq!(everyone.len(), 6);
        assert!(everyone.iter().any(|l| l.owner.as_deref() == Some("bob")));
    }

    #[tokio::test]
    async fn test_huge_page_is_empty_not_overflow() {
        let ledger = ledger();
        ledger.create(&record("alice", "sum")).await.unwrap();

        let mut filter = ListFilter::for_owner("alice");
        filter.page = usize::MAX;
        filter.limit = MAX_PAGE_LIMIT;
        assert!(ledger.list(&filter).await.unwrap().is_empty());

        filter.page = 0;
        assert_eq!(ledger.list(&filter).await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_store_roundtrip() {
        let store = RedisStore::connect("redis://127.0.0.1:6379", 60).await.unwrap();
        let ledger = Ledger::new(Arc::new(store));
        let rec = record("redis-owner", "sum");
        ledger.create(&rec).await.unwrap();
        assert!(ledger.begin(rec.id).await.unwrap());
        let loaded = ledger.snapshot(rec.id).await.unwrap();
        assert_eq!(loaded.status, SubmissionStatus::Compiling);
    }
}
