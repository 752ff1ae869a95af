use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::queries::{self, CorruptRow};
use crate::models::job::{Job, JobStatus};

pub const DEFAULT_STORE_BATCH_LIMIT: usize = 25;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a bulk read. Every requested id lands in exactly one set.
#[derive(Debug, Default)]
pub struct BatchGetOutcome {
    pub found: HashMap<Uuid, Job>,
    /// Ids the store confirmed do not exist.
    pub missing: HashSet<Uuid>,
    /// Ids whose chunk could not be read (timeout, outage, corrupt row).
    pub unprocessed: HashSet<Uuid>,
}

/// Persistence for job records, keyed by job id.
///
/// Single-item calls are atomic per item. Bulk calls are chunked internally
/// to the store's item limit and report failures per id; there is no
/// atomicity across items. Writes never overwrite a record that is already
/// `Done` or `Failed`, and such a skipped write counts as persisted.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put(&self, job: &Job) -> Result<(), StorageError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError>;

    async fn batch_get(&self, ids: &[Uuid]) -> BatchGetOutcome;

    /// Returns the ids that failed to persist.
    async fn batch_put(&self, jobs: &[Job]) -> HashSet<Uuid>;

    /// `Pending` jobs not updated since `older_than`, least recently
    /// updated first.
    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError>;

    /// Set `updated_at` of the jobs among `ids` that are still `Pending`.
    async fn touch_pending(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), StorageError>;

    async fn health_check(&self) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record: {0}")]
    Corrupt(#[from] CorruptRow),
}

/// Order-preserving dedup.
fn unique_ids(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Keep the last write per id, in first-seen order.
fn unique_jobs(jobs: &[Job]) -> Vec<Job> {
    let mut latest: HashMap<Uuid, &Job> = HashMap::with_capacity(jobs.len());
    let mut order = Vec::with_capacity(jobs.len());
    for job in jobs {
        if latest.insert(job.id, job).is_none() {
            order.push(job.id);
        }
    }
    order
        .into_iter()
        .filter_map(|id| latest.get(&id).map(|job| (*job).clone()))
        .collect()
}

async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StorageError::Timeout(timeout))?
}

/// PostgreSQL-backed job store.
pub struct PgJobStore {
    pool: PgPool,
    batch_limit: usize,
    timeout: Duration,
}

impl PgJobStore {
    pub fn new(pool: PgPool, batch_limit: usize, timeout: Duration) -> Self {
        Self {
            pool,
            batch_limit: batch_limit.max(1),
            timeout,
        }
    }

    async fn get_chunk(&self, chunk: &[Uuid]) -> Result<Vec<Job>, StorageError> {
        let rows = bounded(self.timeout, async {
            queries::get_jobs(&self.pool, chunk).await.map_err(StorageError::from)
        })
        .await?;
        rows.into_iter()
            .map(|row| Job::try_from(row).map_err(StorageError::from))
            .collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn put(&self, job: &Job) -> Result<(), StorageError> {
        bounded(self.timeout, async {
            queries::upsert_job(&self.pool, job).await.map_err(StorageError::from)
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        let row = bounded(self.timeout, async {
            queries::get_job(&self.pool, id).await.map_err(StorageError::from)
        })
        .await?;
        Ok(row.map(Job::try_from).transpose()?)
    }

    async fn batch_get(&self, ids: &[Uuid]) -> BatchGetOutcome {
        let mut outcome = BatchGetOutcome::default();

        for chunk in unique_ids(ids).chunks(self.batch_limit) {
            match self.get_chunk(chunk).await {
                Ok(jobs) => {
                    for job in jobs {
                        outcome.found.insert(job.id, job);
                    }
                    outcome.missing.extend(
                        chunk.iter().filter(|id| !outcome.found.contains_key(*id)),
                    );
                }
                Err(e) => {
                    tracing::warn!(chunk_size = chunk.len(), error = %e, "Bulk read chunk failed");
                    outcome.unprocessed.extend(chunk.iter().copied());
                }
            }
        }

        outcome
    }

    async fn batch_put(&self, jobs: &[Job]) -> HashSet<Uuid> {
        let mut failed = HashSet::new();

        for chunk in unique_jobs(jobs).chunks(self.batch_limit) {
            let result = bounded(self.timeout, async {
                queries::upsert_jobs(&self.pool, chunk).await.map_err(StorageError::from)
            })
            .await;

            if let Err(e) = result {
                tracing::warn!(chunk_size = chunk.len(), error = %e, "Bulk write chunk failed");
                failed.extend(chunk.iter().map(|job| job.id));
            }
        }

        failed
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = bounded(self.timeout, async {
            queries::get_stale_pending_jobs(&self.pool, older_than, limit).await.map_err(StorageError::from)
        })
        .await?;
        rows.into_iter()
            .map(|row| Job::try_from(row).map_err(StorageError::from))
            .collect()
    }

    async fn touch_pending(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), StorageError> {
        for chunk in unique_ids(ids).chunks(self.batch_limit) {
            bounded(self.timeout, async {
                queries::touch_pending_jobs(&self.pool, chunk, at)
                    .await
                    .map_err(StorageError::from)
            })
            .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        bounded(self.timeout, async {
            queries::ping(&self.pool).await.map_err(StorageError::from)
        })
        .await
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    /// Remaining forced write failures per id.
    failing_writes: HashMap<Uuid, u32>,
    /// Remaining forced read failures per id; a bulk read fails the whole chunk.
    failing_reads: HashMap<Uuid, u32>,
    /// Added to every call before it touches the data.
    latency: Duration,
}

/// Decrement a one-shot fault counter, returning whether it fired.
fn take_fault(faults: &mut HashMap<Uuid, u32>, id: Uuid) -> bool {
    match faults.get_mut(&id) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// In-memory job store for tests and local development.
///
/// Applies the same chunking, timeout and terminal-state rules as
/// [`PgJobStore`] and can inject per-id read or write failures, latency or a
/// full outage.
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    faults: RwLock<Faults>,
    batch_limit: usize,
    timeout: Duration,
    bulk_calls: AtomicUsize,
}

impl InMemoryJobStore {
    pub fn new(batch_limit: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            batch_limit: batch_limit.max(1),
            timeout: DEFAULT_STORE_TIMEOUT,
            bulk_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Make every call fail until switched back.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.faults.write().await.unavailable = unavailable;
    }

    /// Delay every subsequent call by `latency`.
    pub async fn set_latency(&self, latency: Duration) {
        self.faults.write().await.latency = latency;
    }

    /// Fail the next `times` writes of `id`.
    pub async fn fail_writes(&self, id: Uuid, times: u32) {
        self.faults.write().await.failing_writes.insert(id, times);
    }

    /// Fail the next `times` reads touching `id`.
    pub async fn fail_reads(&self, id: Uuid, times: u32) {
        self.faults.write().await.failing_reads.insert(id, times);
    }

    /// Drop a record, simulating an earlier lost write.
    pub async fn remove(&self, id: Uuid) -> Option<Job> {
        self.jobs.write().await.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Number of chunked bulk calls issued so far.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::Relaxed)
    }

    /// Injected latency followed by the outage check.
    async fn enter(&self) -> Result<(), StorageError> {
        let latency = self.faults.read().await.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.faults.read().await.unavailable {
            return Err(StorageError::Unavailable("in-memory store is offline".into()));
        }
        Ok(())
    }

    async fn check_reads(&self, ids: &[Uuid]) -> Result<(), StorageError> {
        let mut faults = self.faults.write().await;
        let mut rejected = false;
        for id in ids {
            rejected |= take_fault(&mut faults.failing_reads, *id);
        }
        if rejected {
            return Err(StorageError::Unavailable("read rejected".into()));
        }
        Ok(())
    }

    async fn should_fail_write(&self, id: Uuid) -> bool {
        take_fault(&mut self.faults.write().await.failing_writes, id)
    }

    fn apply_write(jobs: &mut HashMap<Uuid, Job>, job: &Job) {
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.is_terminal() => {}
            Some(existing) => {
                existing.state = job.state.clone();
                existing.updated_at = job.updated_at;
            }
            None => {
                jobs.insert(job.id, job.clone());
            }
        }
    }

    async fn read_chunk(&self, chunk: &[Uuid]) -> Result<Vec<Job>, StorageError> {
        self.enter().await?;
        self.check_reads(chunk).await?;
        let jobs = self.jobs.read().await;
        Ok(chunk.iter().filter_map(|id| jobs.get(id).cloned()).collect())
    }

    /// Returns the ids rejected by injected write faults.
    async fn write_chunk(&self, chunk: &[Job]) -> Result<HashSet<Uuid>, StorageError> {
        self.enter().await?;
        let mut rejected = HashSet::new();
        for job in chunk {
            if self.should_fail_write(job.id).await {
                rejected.insert(job.id);
                continue;
            }
            Self::apply_write(&mut *self.jobs.write().await, job);
        }
        Ok(rejected)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_BATCH_LIMIT)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, job: &Job) -> Result<(), StorageError> {
        bounded(self.timeout, async {
            self.enter().await?;
            if self.should_fail_write(job.id).await {
                return Err(StorageError::Unavailable(format!("write of {} rejected", job.id)));
            }
            Self::apply_write(&mut *self.jobs.write().await, job);
            Ok::<(), StorageError>(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        bounded(self.timeout, async {
            self.enter().await?;
            self.check_reads(&[id]).await?;
            Ok::<_, StorageError>(self.jobs.read().await.get(&id).cloned())
        })
        .await
    }

    async fn batch_get(&self, ids: &[Uuid]) -> BatchGetOutcome {
        let mut outcome = BatchGetOutcome::default();

        for chunk in unique_ids(ids).chunks(self.batch_limit) {
            self.bulk_calls.fetch_add(1, Ordering::Relaxed);
            match bounded(self.timeout, self.read_chunk(chunk)).await {
                Ok(jobs) => {
                    for job in jobs {
                        outcome.found.insert(job.id, job);
                    }
                    outcome.missing.extend(
                        chunk.iter().filter(|id| !outcome.found.contains_key(*id)),
                    );
                }
                Err(e) => {
                    tracing::warn!(chunk_size = chunk.len(), error = %e, "Bulk read chunk failed");
                    outcome.unprocessed.extend(chunk.iter().copied());
                }
            }
        }

        outcome
    }

    async fn batch_put(&self, jobs: &[Job]) -> HashSet<Uuid> {
        let mut failed = HashSet::new();

        for chunk in unique_jobs(jobs).chunks(self.batch_limit) {
            self.bulk_calls.fetch_add(1, Ordering::Relaxed);
            match bounded(self.timeout, self.write_chunk(chunk)).await {
                Ok(rejected) => failed.extend(rejected),
                Err(e) => {
                    tracing::warn!(chunk_size = chunk.len(), error = %e, "Bulk write chunk failed");
                    failed.extend(chunk.iter().map(|job| job.id));
                }
            }
        }

        failed
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        bounded(self.timeout, async {
            self.enter().await?;
            let jobs = self.jobs.read().await;
            let mut stale: Vec<Job> = jobs
                .values()
                .filter(|job| job.status() == JobStatus::Pending)
                .filter(|job| job.updated_at < older_than)
                .cloned()
                .collect();
            stale.sort_by_key(|job| job.updated_at);
            stale.truncate(limit);
            Ok::<_, StorageError>(stale)
        })
        .await
    }

    async fn touch_pending(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<(), StorageError> {
        bounded(self.timeout, async {
            self.enter().await?;
            let mut jobs = self.jobs.write().await;
            for id in ids {
                if let Some(job) = jobs.get_mut(id) {
                    if job.status() == JobStatus::Pending {
                        job.updated_at = at;
                    }
                }
            }
            Ok::<(), StorageError>(())
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        bounded(self.timeout, self.enter()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending() -> Job {
        Job::new_pending(json!({"rooms": 2, "area": 50, "floor": 1}))
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryJobStore::new(25);
        let job = pending();
        store.put(&job).await.unwrap();

        let fetched = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(fetched, job);
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_get_chunks_and_reports_missing() {
        let store = InMemoryJobStore::new(25);
        let mut ids = Vec::new();
        for _ in 0..55 {
            let job = pending();
            store.put(&job).await.unwrap();
            ids.push(job.id);
        }
        let ghost = Uuid::new_v4();
        ids.push(ghost);
        ids.push(ids[0]);

        let outcome = store.batch_get(&ids).await;
        assert_eq!(outcome.found.len(), 55);
        assert_eq!(outcome.missing, HashSet::from([ghost]));
        assert!(outcome.unprocessed.is_empty());
        // 56 unique ids with a limit of 25
        assert_eq!(store.bulk_calls(), 3);
    }

    #[tokio::test]
    async fn test_batch_put_reports_partial_failures() {
        let store = InMemoryJobStore::new(2);
        let jobs: Vec<Job> = (0..3).map(|_| pending()).collect();
        for job in &jobs {
            store.put(job).await.unwrap();
        }
        store.fail_writes(jobs[1].id, 1).await;

        let done: Vec<Job> = jobs.iter().map(|j| j.complete(1.0).unwrap()).collect();
        let failed = store.batch_put(&done).await;
        assert_eq!(failed, HashSet::from([jobs[1].id]));

        assert!(store.get(jobs[0].id).await.unwrap().unwrap().is_terminal());
        assert!(!store.get(jobs[1].id).await.unwrap().unwrap().is_terminal());
        assert!(store.get(jobs[2].id).await.unwrap().unwrap().is_terminal());

        // the injected failure was one-shot
        assert!(store.batch_put(&done[1..2]).await.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_records_are_not_overwritten() {
        let store = InMemoryJobStore::new(25);
        let job = pending();
        store.put(&job).await.unwrap();

        let first = job.complete(100.0).unwrap();
        assert!(store.batch_put(&[first]).await.is_empty());

        let second = job.fail("late duplicate").unwrap();
        assert!(store.batch_put(&[second.clone()]).await.is_empty());
        store.put(&second).await.unwrap();

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state.result(), Some(100.0));
        assert!(stored.state.error().is_none());
    }

    #[tokio::test]
    async fn test_outage_marks_everything_unprocessed() {
        let store = InMemoryJobStore::new(25);
        let job = pending();
        store.put(&job).await.unwrap();
        store.set_unavailable(true).await;

        let outcome = store.batch_get(&[job.id]).await;
        assert!(outcome.found.is_empty());
        assert_eq!(outcome.unprocessed, HashSet::from([job.id]));
        assert!(store.get(job.id).await.is_err());
        assert!(store.health_check().await.is_err());

        let failed = store.batch_put(&[job.complete(1.0).unwrap()]).await;
        assert_eq!(failed, HashSet::from([job.id]));
    }

    #[tokio::test]
    async fn test_list_stale_pending() {
        let store = InMemoryJobStore::new(25);
        let mut old = pending();
        old.created_at = Utc::now() - chrono::Duration::minutes(10);
        old.updated_at = old.created_at;
        let fresh = pending();
        let mut old_done = pending();
        old_done.created_at = old.created_at;
        let old_done = old_done.complete(5.0).unwrap();

        for job in [&old, &fresh, &old_done] {
            store.put(job).await.unwrap();
        }

        let stale = store
            .list_stale_pending(Utc::now() - chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
    }

    #[tokio::test]
    async fn test_touch_pending_skips_finished_jobs() {
        let store = InMemoryJobStore::new(25);
        let waiting = pending();
        let done = pending().complete(3.0).unwrap();
        store.put(&waiting).await.unwrap();
        store.put(&done).await.unwrap();

        let at = Utc::now() + chrono::Duration::minutes(1);
        store.touch_pending(&[waiting.id, done.id], at).await.unwrap();

        assert_eq!(store.get(waiting.id).await.unwrap().unwrap().updated_at, at);
        assert_eq!(store.get(done.id).await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn test_failed_read_chunk_only_affects_its_ids() {
        let store = InMemoryJobStore::new(2);
        let jobs: Vec<Job> = (0..4).map(|_| pending()).collect();
        for job in &jobs {
            store.put(job).await.unwrap();
        }
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        store.fail_reads(ids[3], 1).await;

        let outcome = store.batch_get(&ids).await;
        assert_eq!(outcome.found.len(), 2);
        assert!(outcome.found.contains_key(&ids[0]) && outcome.found.contains_key(&ids[1]));
        assert_eq!(outcome.unprocessed, HashSet::from([ids[2], ids[3]]));
        assert!(outcome.missing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_calls_time_out() {
        let store = InMemoryJobStore::new(2).with_timeout(Duration::from_millis(100));
        let job = pending();
        store.put(&job).await.unwrap();
        store.set_latency(Duration::from_secs(1)).await;

        let err = store.get(job.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout(t) if t == Duration::from_millis(100)));
        assert!(matches!(
            store.put(&job.complete(1.0).unwrap()).await,
            Err(StorageError::Timeout(_))
        ));

        let outcome = store.batch_get(&[job.id]).await;
        assert_eq!(outcome.unprocessed, HashSet::from([job.id]));
        let failed = store.batch_put(&[job.complete(1.0).unwrap()]).await;
        assert_eq!(failed, HashSet::from([job.id]));

        store.set_latency(Duration::ZERO).await;
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status(), JobStatus::Pending);
    }

    #[test]
    fn test_unique_jobs_keeps_last_write() {
        let job = pending();
        let a = job.complete(1.0).unwrap();
        let b = job.complete(2.0).unwrap();
        let deduped = unique_jobs(&[a, b]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].state.result(), Some(2.0));
    }
}
