//! Redis queue store implementation.
//!
//! Layout per the persisted-state contract: a sorted set per
//! `(worker_kind, partition)` of `(score, task_id)` where the score encodes
//! the priority tier and enqueue time; a plain key per task record; a
//! delayed sorted set per `(worker_kind, partition)` for retry backoff; and
//! a per-worker-kind dead-letter sorted set keyed by dead-letter time.
//!
//! The atomic claim is `ZPOPMIN`: no two workers can pop the same member.
//! Cooperative cancellation of an already-claimed task is a separate marker
//! key (single write), merged into the record on reads, so no record is ever
//! mutated by two owners.

use super::RedisKeys;
use crate::config::QueueConfig;
use crate::partition::ordering_score;
use crate::store::QueueStore;
use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use relay_core::{
    DeadLetterId, DeadLetterRecord, DispatchError, DispatchResult, TaskId, TaskRecord, TaskStatus,
    WorkerKind,
};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

fn unavailable(e: impl Display) -> DispatchError {
    DispatchError::QueueUnavailable(e.to_string())
}

/// Redis-backed implementation of [`QueueStore`].
pub struct RedisQueueStore {
    pool: Pool,
    keys: RedisKeys,
    dlq_cap: usize,
}

impl RedisQueueStore {
    /// Create a new Redis queue store.
    #[must_use]
    pub fn new(pool: Pool, config: &QueueConfig) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(&config.redis.key_prefix),
            dlq_cap: config.dlq.max_per_worker_kind.max(1),
        }
    }

    async fn conn(&self) -> DispatchResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(unavailable)
    }

    fn cancel_marker(&self, task_id: &TaskId) -> String {
        format!("{}.cancel", self.keys.task(&task_id.to_string()))
    }

    async fn fetch(
        &self,
        conn: &mut deadpool_redis::Connection,
        task_id: &TaskId,
    ) -> DispatchResult<Option<TaskRecord>> {
        let json: Option<String> = conn
            .get(self.keys.task(&task_id.to_string()))
            .await
            .map_err(unavailable)?;
        match json {
            Some(json) => {
                let mut task: TaskRecord = serde_json::from_str(&json)?;
                if !task.cancel_requested {
                    task.cancel_requested = conn
                        .exists(self.cancel_marker(task_id))
                        .await
                        .map_err(unavailable)?;
                }
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn persist(
        &self,
        conn: &mut deadpool_redis::Connection,
        task: &TaskRecord,
    ) -> DispatchResult<()> {
        let json = serde_json::to_string(task)?;
        let _: () = conn
            .set(self.keys.task(&task.id.to_string()), json)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, task: &TaskRecord) -> DispatchResult<()> {
        let mut conn = self.conn().await?;

        let json = serde_json::to_string(task)?;
        let score = ordering_score(task.priority, task.created_at.timestamp_millis());
        let queue_key = self.keys.queue(task.worker_kind, task.partition);
        let task_key = self.keys.task(&task.id.to_string());

        let _: () = redis::pipe()
            .set(&task_key, &json)
            .zadd(&queue_key, task.id.to_string(), score)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        debug!(
            task_id = %task.id,
            partition = task.partition,
            priority = %task.priority,
            "Enqueued task"
        );
        Ok(())
    }

    async fn claim(
        &self,
        worker_kind: WorkerKind,
        partition: u32,
        worker_id: &str,
    ) -> DispatchResult<Option<TaskRecord>> {
        let mut conn = self.conn().await?;
        let queue_key = self.keys.queue(worker_kind, partition);

        loop {
            let popped: Vec<(String, f64)> = conn
                .zpopmin(&queue_key, 1)
                .await
                .map_err(unavailable)?;

            let Some((raw_id, _score)) = popped.into_iter().next() else {
                return Ok(None);
            };

            let Ok(task_id) = TaskId::parse(&raw_id) else {
                warn!(raw_id = %raw_id, "Unparseable id in queue index");
                continue;
            };

            match self.fetch(&mut conn, &task_id).await? {
                Some(mut task) => {
                    task.transition(TaskStatus::Running)?;
                    if task.started_at.is_none() {
                        task.started_at = Some(Utc::now());
                    }
                    self.persist(&mut conn, &task).await?;
                    debug!(task_id = %task_id, worker_id = %worker_id, "Claimed task");
                    return Ok(Some(task));
                }
                None => {
                    warn!(task_id = %task_id, "Index entry without task record");
                }
            }
        }
    }

    async fn update(&self, task: &TaskRecord) -> DispatchResult<()> {
        let mut conn = self.conn().await?;
        self.persist(&mut conn, task).await
    }

    async fn retry(&self, task: &TaskRecord, delay: Duration) -> DispatchResult<()> {
        let mut conn = self.conn().await?;

        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let json = serde_json::to_string(task)?;
        let delayed_key = self.keys.delayed(task.worker_kind, task.partition);
        let task_key = self.keys.task(&task.id.to_string());

        let _: () = redis::pipe()
            .set(&task_key, &json)
            .zadd(&delayed_key, task.id.to_string(), due_ms as f64)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        debug!(
            task_id = %task.id,
            retry_count = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry"
        );
        Ok(())
    }

    async fn promote_due(&self, worker_kind: WorkerKind, partition: u32) -> DispatchResult<u64> {
        let mut conn = self.conn().await?;

        let delayed_key = self.keys.delayed(worker_kind, partition);
        let queue_key = self.keys.queue(worker_kind, partition);
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = conn
            .zrangebyscore(&delayed_key, 0i64, now_ms)
            .await
            .map_err(unavailable)?;

        let mut promoted = 0u64;
        for raw_id in due {
            let Ok(task_id) = TaskId::parse(&raw_id) else {
                continue;
            };
            let Some(task) = self.fetch(&mut conn, &task_id).await? else {
                let _: () = conn.zrem(&delayed_key, &raw_id).await.map_err(unavailable)?;
                continue;
            };

            // Promotion time is the FIFO key: a retried task rejoins the
            // back of its tier.
            let score = ordering_score(task.priority, now_ms);
            let _: () = redis::pipe()
                .zrem(&delayed_key, &raw_id)
                .zadd(&queue_key, &raw_id, score)
                .query_async(&mut *conn)
                .await
                .map_err(unavailable)?;
            promoted += 1;
        }

        if promoted > 0 {
            debug!(worker_kind = %worker_kind, partition, count = promoted, "Promoted delayed tasks");
        }
        Ok(promoted)
    }

    async fn cancel(&self, task_id: &TaskId) -> DispatchResult<TaskStatus> {
        let mut conn = self.conn().await?;

        let Some(mut task) = self.fetch(&mut conn, task_id).await? else {
            return Err(DispatchError::NotFound {
                resource: "task",
                id: task_id.to_string(),
            });
        };

        if task.status.is_terminal() {
            return Err(DispatchError::Conflict(format!(
                "task {task_id} already terminal ({})",
                task.status
            )));
        }

        let queue_key = self.keys.queue(task.worker_kind, task.partition);
        let delayed_key = self.keys.delayed(task.worker_kind, task.partition);

        // Only a successful index removal proves no worker holds a claim.
        let (removed_ready, removed_delayed): (i64, i64) = redis::pipe()
            .zrem(&queue_key, task_id.to_string())
            .zrem(&delayed_key, task_id.to_string())
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        if removed_ready + removed_delayed > 0 {
            task.transition(TaskStatus::Cancelled)?;
            task.completed_at = Some(Utc::now());
            self.persist(&mut conn, &task).await?;
            debug!(task_id = %task_id, "Cancelled queued task");
            Ok(TaskStatus::Cancelled)
        } else {
            // Claimed in the meantime: cooperative marker, observed by the
            // supervisor when the attempt finishes.
            let _: () = conn
                .set(self.cancel_marker(task_id), 1i32)
                .await
                .map_err(unavailable)?;
            debug!(task_id = %task_id, "Requested cooperative cancellation");
            Ok(TaskStatus::Running)
        }
    }

    async fn get(&self, task_id: &TaskId) -> DispatchResult<Option<TaskRecord>> {
        let mut conn = self.conn().await?;
        self.fetch(&mut conn, task_id).await
    }

    async fn depth(&self, worker_kind: WorkerKind, partition: u32) -> DispatchResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = conn
            .zcard(self.keys.queue(worker_kind, partition))
            .await
            .map_err(unavailable)?;
        Ok(count)
    }

    async fn dead_letter(&self, record: &DeadLetterRecord) -> DispatchResult<()> {
        let mut conn = self.conn().await?;

        let kind = record.task.worker_kind;
        let dlq_key = self.keys.dlq(kind);
        let record_key = self.keys.dlq_record(&record.id.to_string());
        let record_json = serde_json::to_string(record)?;

        let mut task = record.task.clone();
        task.status = TaskStatus::DeadLettered;
        task.completed_at = Some(record.dead_lettered_at);
        let task_json = serde_json::to_string(&task)?;

        let _: () = redis::pipe()
            .set(&record_key, &record_json)
            .zadd(
                &dlq_key,
                record.id.to_string(),
                record.dead_lettered_at.timestamp_millis() as f64,
            )
            .set(self.keys.task(&task.id.to_string()), &task_json)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        // Bounded retention: evict oldest past the per-kind cap.
        let count: u64 = conn.zcard(&dlq_key).await.map_err(unavailable)?;
        if count > self.dlq_cap as u64 {
            let overflow = (count - self.dlq_cap as u64) as isize;
            let evicted: Vec<(String, f64)> = conn
                .zpopmin(&dlq_key, overflow)
                .await
                .map_err(unavailable)?;
            for (dlq_id, _) in evicted {
                let _: () = conn
                    .del(self.keys.dlq_record(&dlq_id))
                    .await
                    .map_err(unavailable)?;
                warn!(dlq_id = %dlq_id, worker_kind = %kind, "Evicted oldest dead-letter record");
            }
        }

        debug!(dlq_id = %record.id, task_id = %record.task.id, "Dead-lettered task");
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        worker_kind: Option<WorkerKind>,
    ) -> DispatchResult<Vec<DeadLetterRecord>> {
        let mut conn = self.conn().await?;

        let kinds: Vec<WorkerKind> = match worker_kind {
            Some(kind) => vec![kind],
            None => WorkerKind::ALL.to_vec(),
        };

        let mut records = Vec::new();
        for kind in kinds {
            let ids: Vec<String> = conn
                .zrange(self.keys.dlq(kind), 0, -1)
                .await
                .map_err(unavailable)?;
            for dlq_id in ids {
                let json: Option<String> = conn
                    .get(self.keys.dlq_record(&dlq_id))
                    .await
                    .map_err(unavailable)?;
                if let Some(json) = json {
                    records.push(serde_json::from_str(&json)?);
                }
            }
        }

        records.sort_by_key(|r: &DeadLetterRecord| r.dead_lettered_at);
        Ok(records)
    }

    async fn remove_dead_letter(
        &self,
        id: &DeadLetterId,
    ) -> DispatchResult<Option<DeadLetterRecord>> {
        let mut conn = self.conn().await?;

        let record_key = self.keys.dlq_record(&id.to_string());
        let json: Option<String> = conn.get(&record_key).await.map_err(unavailable)?;

        let Some(json) = json else {
            return Ok(None);
        };
        let record: DeadLetterRecord = serde_json::from_str(&json)?;

        let _: () = redis::pipe()
            .zrem(self.keys.dlq(record.task.worker_kind), id.to_string())
            .del(&record_key)
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;

        Ok(Some(record))
    }

    async fn health_check(&self) -> DispatchResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}
