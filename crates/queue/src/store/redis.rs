//! Redis-backed queue and dead-letter store.
//!
//! ## Layout
//!
//! - **`{prefix}:job:{job_id}`**: a job in the primary queue (descriptor,
//!   ready time, insertion sequence and lease)
//! - **`{prefix}:ready:{queue}`**: sorted set of claimable jobs scored by
//!   negated priority; members are `{ready_at_ms}:{seq}:{job_id}`, so equal
//!   priorities fall back to ready time, then insertion order
//! - **`{prefix}:delayed:{queue}`**: sorted set of delayed job ids by ready time
//! - **`{prefix}:leases:{queue}`**: sorted set of running job ids by lease expiry
//! - **`{prefix}:entry:{entry_id}`**: a dead-letter entry
//! - **`{prefix}:dead:{job_id}`**: id of the entry holding the job
//! - **`{prefix}:scheduled`**: sorted set of scheduled entry ids by ready time
//! - **`{prefix}:quarantined:{queue}`**: sorted set of quarantined entry ids
//!   by failure time
//! - **`{prefix}:queues`**: names of every queue that received a job
//! - **`{prefix}:seq`**: insertion counter
//!
//! Every mutation is an optimistic `WATCH`/`MULTI`/`EXEC` transaction over the
//! index it reads and the records it rewrites. A concurrent writer aborts the
//! `EXEC` and the closure reruns, so moves between the primary queue and the
//! dead-letter partitions stay atomic across processes. Claims read the head
//! of an index; nothing on the polling path scans every job.

use std::cmp::Reverse;
use std::fmt::Display;
use std::time::Duration;

use ::redis::{Client, Commands, Connection, Pipeline, RedisResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use jobward_core::{EntryId, JobId};

use super::{ExpiredClaim, QueueDepth, QueueStore, StoreError};
use crate::dead_letter::{DeadLetterEntry, EntryStatus};
use crate::job::{ClaimedJob, JobDescriptor, JobLocation, Lease, add_millis};

const DEFAULT_PREFIX: &str = "jobward";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedJob {
    job: JobDescriptor,
    ready_at: DateTime<Utc>,
    seq: u64,
    lease: Option<Lease>,
}

impl QueuedJob {
    /// Member of the ready index. Zero padding makes lexicographic order
    /// match `(ready_at, seq)`.
    fn ready_member(&self) -> String {
        format!("{:015}:{:020}:{}", millis(self.ready_at), self.seq, self.job.id)
    }
}

/// A claim candidate and whether it still sits in the delayed index.
struct Candidate {
    queued: QueuedJob,
    delayed: bool,
}

/// Outcome of one transaction attempt: `None` when `EXEC` was aborted.
type Attempt<T> = RedisResult<Option<Result<T, StoreError>>>;

#[derive(Debug, Clone)]
pub struct RedisQueueStore {
    client: Client,
    prefix: String,
    seq_key: String,
    queues_key: String,
    scheduled_key: String,
}

impl RedisQueueStore {
    /// Open a store at `redis_url` under the default `jobward` key prefix.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StoreError> {
        Self::with_prefix(redis_url, DEFAULT_PREFIX)
    }

    pub fn with_prefix(redis_url: impl AsRef<str>, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url.as_ref()).map_err(backend)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            seq_key: format!("{prefix}:seq"),
            queues_key: format!("{prefix}:queues"),
            scheduled_key: format!("{prefix}:scheduled"),
        })
    }

    fn job_key(&self, job_id: impl Display) -> String {
        format!("{}:job:{job_id}", self.prefix)
    }

    fn dead_key(&self, job_id: impl Display) -> String {
        format!("{}:dead:{job_id}", self.prefix)
    }

    fn entry_key(&self, entry_id: impl Display) -> String {
        format!("{}:entry:{entry_id}", self.prefix)
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:ready:{queue}", self.prefix)
    }

    fn delayed_key(&self, queue: &str) -> String {
        format!("{}:delayed:{queue}", self.prefix)
    }

    fn leases_key(&self, queue: &str) -> String {
        format!("{}:leases:{queue}", self.prefix)
    }

    fn quarantined_key(&self, queue: &str) -> String {
        format!("{}:quarantined:{queue}", self.prefix)
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        self.client.get_connection().map_err(backend)
    }

    /// Run `body` inside a transaction watching `keys`, retrying on conflict.
    /// `body` reads through the connection (and may `WATCH` more keys before
    /// reading them) and queues writes on the pipeline; it returns `Ok(Err(..))`
    /// to abandon without writing.
    fn transact<T, F>(&self, keys: &[String], mut body: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut Connection, &mut Pipeline) -> RedisResult<Result<T, StoreError>>,
    {
        let mut con = self.connection()?;
        let result = ::redis::transaction(&mut con, keys, |con, pipe| -> Attempt<T> {
            match body(con, pipe)? {
                Ok(value) => {
                    let committed: Option<()> = pipe.query(con)?;
                    Ok(committed.map(|_| Ok(value)))
                }
                Err(e) => Ok(Some(Err(e))),
            }
        });
        result.map_err(backend)?
    }

    fn load_job(&self, con: &mut Connection, job_id: JobId) -> RedisResult<Result<Option<QueuedJob>, StoreError>> {
        load(con, &self.job_key(job_id))
    }

    fn load_entry(
        &self,
        con: &mut Connection,
        entry_id: EntryId,
    ) -> RedisResult<Result<Option<DeadLetterEntry>, StoreError>> {
        load(con, &self.entry_key(entry_id))
    }

    /// The queued job `job_id`, provided `token` still owns its lease.
    fn load_leased(
        &self,
        con: &mut Connection,
        job_id: JobId,
        token: Uuid,
    ) -> RedisResult<Result<QueuedJob, StoreError>> {
        let queued = match self.load_job(con, job_id)? {
            Ok(Some(q)) => q,
            Ok(None) => return Ok(Err(StoreError::NotFound(job_id))),
            Err(e) => return Ok(Err(e)),
        };
        if queued.lease.as_ref().is_some_and(|l| l.token == token) {
            Ok(Ok(queued))
        } else {
            Ok(Err(StoreError::LeaseLost(job_id)))
        }
    }

    fn next_seq(&self, con: &mut Connection) -> RedisResult<u64> {
        con.incr(&self.seq_key, 1u64)
    }

    fn put_job(&self, pipe: &mut Pipeline, queued: &QueuedJob) -> Result<(), StoreError> {
        pipe.set(self.job_key(queued.job.id), encode(queued)?).ignore();
        Ok(())
    }

    /// Store a waiting job and index it as ready or delayed.
    fn put_waiting(&self, pipe: &mut Pipeline, queued: &QueuedJob, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.put_job(pipe, queued)?;
        if queued.ready_at <= now {
            pipe.zadd(
                self.ready_key(&queued.job.queue),
                queued.ready_member(),
                ready_score(queued.job.priority),
            )
            .ignore();
        } else {
            pipe.zadd(
                self.delayed_key(&queued.job.queue),
                queued.job.id.to_string(),
                millis(queued.ready_at),
            )
            .ignore();
        }
        Ok(())
    }

    fn put_running(&self, pipe: &mut Pipeline, queued: &QueuedJob, lease: &Lease) -> Result<(), StoreError> {
        self.put_job(pipe, queued)?;
        pipe.zadd(
            self.leases_key(&queued.job.queue),
            queued.job.id.to_string(),
            millis(lease.expires_at),
        )
        .ignore();
        Ok(())
    }

    fn drop_job(&self, pipe: &mut Pipeline, queued: &QueuedJob) {
        pipe.del(self.job_key(queued.job.id)).ignore();
        pipe.zrem(self.leases_key(&queued.job.queue), queued.job.id.to_string())
            .ignore();
    }

    /// The index an entry sits in and its score there.
    fn entry_index(&self, entry: &DeadLetterEntry) -> (String, i64) {
        match entry.status {
            EntryStatus::Scheduled => (
                self.scheduled_key.clone(),
                millis(entry.ready_at.unwrap_or(entry.failed_at)),
            ),
            EntryStatus::Quarantined => (self.quarantined_key(&entry.original_queue), millis(entry.failed_at)),
        }
    }

    fn put_entry(&self, pipe: &mut Pipeline, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        let (index, score) = self.entry_index(entry);
        pipe.set(self.entry_key(entry.id), encode(entry)?).ignore();
        pipe.set(self.dead_key(entry.job_id), entry.id.to_string()).ignore();
        pipe.zadd(index, entry.id.to_string(), score).ignore();
        Ok(())
    }

    fn drop_entry(&self, pipe: &mut Pipeline, entry: &DeadLetterEntry) {
        let (index, _) = self.entry_index(entry);
        pipe.del(self.entry_key(entry.id)).ignore();
        pipe.del(self.dead_key(entry.job_id)).ignore();
        pipe.zrem(index, entry.id.to_string()).ignore();
    }

    /// Put a job leaving the dead-letter store back into its queue.
    fn requeue(
        &self,
        con: &mut Connection,
        pipe: &mut Pipeline,
        entry: &DeadLetterEntry,
        job: JobDescriptor,
        now: DateTime<Utc>,
    ) -> RedisResult<Result<(), StoreError>> {
        let seq = self.next_seq(con)?;
        self.drop_entry(pipe, entry);
        Ok(self.put_waiting(
            pipe,
            &QueuedJob {
                job,
                ready_at: now,
                seq,
                lease: None,
            },
            now,
        ))
    }
}

fn backend(e: ::redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis().max(0)
}

/// Ready-index score: lower claims first.
fn ready_score(priority: i32) -> i64 {
    -i64::from(priority)
}

fn member_job_id(member: &str) -> Option<JobId> {
    member.rsplit(':').next()?.parse().ok()
}

fn watch(con: &mut Connection, key: &str) -> RedisResult<()> {
    ::redis::cmd("WATCH").arg(key).query(con)
}

fn load<T: DeserializeOwned>(con: &mut Connection, key: &str) -> RedisResult<Result<Option<T>, StoreError>> {
    let raw: Option<String> = con.get(key)?;
    Ok(raw.map(|s| decode(&s)).transpose())
}

/// Fetch `keys` in one round trip; missing keys come back as `None`.
fn load_many<T: DeserializeOwned>(
    con: &mut Connection,
    keys: &[String],
) -> RedisResult<Result<Vec<Option<T>>, StoreError>> {
    if keys.is_empty() {
        return Ok(Ok(Vec::new()));
    }
    let mut pipe = ::redis::pipe();
    for key in keys {
        pipe.get(key);
    }
    let raw: Vec<Option<String>> = pipe.query(con)?;
    Ok(raw.into_iter().map(|r| r.map(|s| decode(&s)).transpose()).collect())
}

/// Unwrap a domain result inside a transaction body.
macro_rules! tri {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(err) => return Ok(Err(err)),
        }
    };
}

impl QueueStore for RedisQueueStore {
    fn enqueue(&self, job: JobDescriptor, now: DateTime<Utc>) -> Result<JobId, StoreError> {
        let id = job.id;
        let job_key = self.job_key(id);
        let dead_key = self.dead_key(id);
        let mut queued = QueuedJob {
            ready_at: job.ready_at(now),
            job,
            seq: 0,
            lease: None,
        };

        self.transact(&[job_key.clone(), dead_key.clone()], |con, pipe| {
            let in_queue: bool = con.exists(&job_key)?;
            let in_dead_letter: bool = con.exists(&dead_key)?;
            if in_queue || in_dead_letter {
                return Ok(Err(StoreError::AlreadyExists(id)));
            }
            queued.seq = self.next_seq(con)?;
            tri!(self.put_waiting(pipe, &queued, now));
            pipe.sadd(&self.queues_key, &queued.job.queue).ignore();
            Ok(Ok(id))
        })
    }

    fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedJob>, StoreError> {
        let ready_key = self.ready_key(queue);
        let delayed_key = self.delayed_key(queue);

        self.transact(&[ready_key.clone(), delayed_key.clone()], |con, pipe| {
            let due: Vec<String> = con.zrangebyscore(&delayed_key, "-inf", millis(now))?;
            let head: Vec<String> = con.zrange(&ready_key, 0, 0)?;

            let mut candidates = Vec::with_capacity(due.len() + 1);
            for raw in &due {
                pipe.zrem(&delayed_key, raw).ignore();
                let Ok(job_id) = raw.parse::<JobId>() else {
                    continue;
                };
                if let Some(queued) = tri!(self.load_job(con, job_id)?) {
                    candidates.push(Candidate { queued, delayed: true });
                }
            }
            if let Some(member) = head.first() {
                let queued = match member_job_id(member) {
                    Some(job_id) => tri!(self.load_job(con, job_id)?),
                    None => None,
                };
                match queued {
                    Some(queued) => candidates.push(Candidate { queued, delayed: false }),
                    None => {
                        pipe.zrem(&ready_key, member).ignore();
                    }
                }
            }

            let best = candidates
                .iter()
                .enumerate()
                .filter(|(_, c)| c.queued.ready_at <= now)
                .min_by_key(|(_, c)| (Reverse(c.queued.job.priority), c.queued.ready_at, c.queued.seq))
                .map(|(i, _)| i);
            let chosen = best.map(|i| candidates.swap_remove(i));

            for c in candidates.iter().filter(|c| c.delayed) {
                pipe.zadd(&ready_key, c.queued.ready_member(), ready_score(c.queued.job.priority))
                    .ignore();
            }
            let Some(Candidate { mut queued, delayed }) = chosen else {
                return Ok(Ok(None));
            };
            if !delayed {
                pipe.zrem(&ready_key, queued.ready_member()).ignore();
            }

            let lease = Lease::new(worker_id, now, lease_for);
            queued.job.attempts_made += 1;
            queued.lease = Some(lease.clone());
            tri!(self.put_running(pipe, &queued, &lease));

            Ok(Ok(Some(ClaimedJob { job: queued.job, lease })))
        })
    }

    fn extend_lease(
        &self,
        job_id: JobId,
        token: Uuid,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease, StoreError> {
        self.transact(&[self.job_key(job_id)], |con, pipe| {
            let mut queued = tri!(self.load_leased(con, job_id, token)?);
            let Some(lease) = queued.lease.as_mut() else {
                return Ok(Err(StoreError::LeaseLost(job_id)));
            };
            lease.expires_at = add_millis(now, lease_for.as_millis().min(u64::MAX as u128) as u64);
            let lease = lease.clone();
            tri!(self.put_running(pipe, &queued, &lease));
            Ok(Ok(lease))
        })
    }

    fn complete(&self, job_id: JobId, token: Uuid) -> Result<(), StoreError> {
        self.transact(&[self.job_key(job_id)], |con, pipe| {
            let queued = tri!(self.load_leased(con, job_id, token)?);
            self.drop_job(pipe, &queued);
            Ok(Ok(()))
        })
    }

    fn move_to_dead_letter(&self, job_id: JobId, token: Uuid, entry: DeadLetterEntry) -> Result<(), StoreError> {
        self.transact(&[self.job_key(job_id)], |con, pipe| {
            let queued = tri!(self.load_leased(con, job_id, token)?);
            self.drop_job(pipe, &queued);
            tri!(self.put_entry(pipe, &entry));
            Ok(Ok(()))
        })
    }

    fn claim_expired_lease(
        &self,
        queue: &str,
        worker_id: &str,
        lease_for: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ExpiredClaim>, StoreError> {
        let leases_key = self.leases_key(queue);

        self.transact(&[leases_key.clone()], |con, pipe| {
            let ids: Vec<String> = con.zrangebyscore_limit(&leases_key, "-inf", millis(now), 0, 1)?;
            let Some(raw) = ids.first() else {
                return Ok(Ok(None));
            };
            let Ok(job_id) = raw.parse::<JobId>() else {
                pipe.zrem(&leases_key, raw).ignore();
                return Ok(Ok(None));
            };
            watch(con, &self.job_key(job_id))?;
            let Some(mut queued) = tri!(self.load_job(con, job_id)?) else {
                pipe.zrem(&leases_key, raw).ignore();
                return Ok(Ok(None));
            };
            let Some(previous) = queued.lease.clone() else {
                pipe.zrem(&leases_key, raw).ignore();
                return Ok(Ok(None));
            };
            if !previous.is_expired(now) {
                return Ok(Ok(None));
            }

            let lease = Lease::new(worker_id, now, lease_for);
            queued.lease = Some(lease.clone());
            tri!(self.put_running(pipe, &queued, &lease));

            Ok(Ok(Some(ExpiredClaim {
                claimed: ClaimedJob { job: queued.job, lease },
                expired: previous,
            })))
        })
    }

    fn promote_due_scheduled(&self, now: DateTime<Utc>) -> Result<Option<JobDescriptor>, StoreError> {
        self.transact(&[self.scheduled_key.clone()], |con, pipe| {
            let ids: Vec<String> = con.zrangebyscore_limit(&self.scheduled_key, "-inf", millis(now), 0, 1)?;
            let Some(raw) = ids.first() else {
                return Ok(Ok(None));
            };
            let Ok(entry_id) = raw.parse::<EntryId>() else {
                pipe.zrem(&self.scheduled_key, raw).ignore();
                return Ok(Ok(None));
            };
            watch(con, &self.entry_key(entry_id))?;
            let Some(entry) = tri!(self.load_entry(con, entry_id)?) else {
                pipe.zrem(&self.scheduled_key, raw).ignore();
                return Ok(Ok(None));
            };
            if !entry.is_due(now) {
                return Ok(Ok(None));
            }

            let job = entry.requeued_job();
            tri!(self.requeue(con, pipe, &entry, job.clone(), now)?);
            Ok(Ok(Some(job)))
        })
    }

    fn requeue_quarantined(&self, entry_id: EntryId, now: DateTime<Utc>) -> Result<JobDescriptor, StoreError> {
        self.transact(&[self.entry_key(entry_id)], |con, pipe| {
            let entry = match tri!(self.load_entry(con, entry_id)?) {
                None => return Ok(Err(StoreError::EntryNotFound(entry_id))),
                Some(e) if e.status != EntryStatus::Quarantined => {
                    return Ok(Err(StoreError::NotQuarantined(entry_id)));
                }
                Some(e) => e,
            };
            let job = entry.manually_retried_job();
            tri!(self.requeue(con, pipe, &entry, job.clone(), now)?);
            Ok(Ok(job))
        })
    }

    fn get_entry(&self, entry_id: EntryId) -> Result<Option<DeadLetterEntry>, StoreError> {
        let mut con = self.connection()?;
        self.load_entry(&mut con, entry_id).map_err(backend)?
    }

    fn list_entries(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut con = self.connection()?;
        let queues: Vec<String> = match queue {
            Some(q) => vec![q.to_string()],
            None => con.smembers(&self.queues_key).map_err(backend)?,
        };

        let mut ids: Vec<String> = con.zrange(&self.scheduled_key, 0, -1).map_err(backend)?;
        for q in &queues {
            let quarantined: Vec<String> = con.zrange(self.quarantined_key(q), 0, -1).map_err(backend)?;
            ids.extend(quarantined);
        }
        let keys: Vec<String> = ids.iter().map(|id| self.entry_key(id)).collect();
        let entries: Vec<Option<DeadLetterEntry>> = load_many(&mut con, &keys).map_err(backend)??;

        Ok(entries
            .into_iter()
            .flatten()
            .filter(|e| queue.is_none_or(|q| e.original_queue == q))
            .collect())
    }

    fn purge_quarantined_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let queues: Vec<String> = self.connection()?.smembers(&self.queues_key).map_err(backend)?;
        let keys: Vec<String> = queues.iter().map(|q| self.quarantined_key(q)).collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        self.transact(&keys, |con, pipe| {
            let mut doomed = Vec::new();
            for key in &keys {
                let ids: Vec<String> = con.zrangebyscore(key, "-inf", millis(cutoff))?;
                let entry_keys: Vec<String> = ids.iter().map(|id| self.entry_key(id)).collect();
                let entries: Vec<Option<DeadLetterEntry>> = tri!(load_many(con, &entry_keys)?);
                for (id, entry) in ids.iter().zip(entries) {
                    match entry {
                        None => {
                            pipe.zrem(key, id).ignore();
                        }
                        Some(e) if e.is_quarantined() && e.failed_at < cutoff => {
                            self.drop_entry(pipe, &e);
                            doomed.push(e);
                        }
                        Some(_) => {}
                    }
                }
            }
            Ok(Ok(doomed))
        })
    }

    fn count_quarantined(&self, queue: &str) -> Result<usize, StoreError> {
        self.connection()?
            .zcard(self.quarantined_key(queue))
            .map_err(backend)
    }

    fn locate_job(&self, job_id: JobId) -> Result<Vec<JobLocation>, StoreError> {
        let mut con = self.connection()?;
        let mut found = Vec::new();

        if let Some(queued) = self.load_job(&mut con, job_id).map_err(backend)?? {
            found.push(match queued.lease {
                Some(_) => JobLocation::Running,
                None => JobLocation::Waiting,
            });
        }
        let entry_id: Option<String> = con.get(self.dead_key(job_id)).map_err(backend)?;
        if let Some(entry_id) = entry_id.and_then(|raw| raw.parse::<EntryId>().ok())
            && let Some(entry) = self.load_entry(&mut con, entry_id).map_err(backend)??
        {
            found.push(match entry.status {
                EntryStatus::Scheduled => JobLocation::Scheduled(entry.id),
                EntryStatus::Quarantined => JobLocation::Quarantined(entry.id),
            });
        }

        Ok(found)
    }

    fn queue_depth(&self, queue: &str) -> Result<QueueDepth, StoreError> {
        let mut con = self.connection()?;
        let ready: usize = con.zcard(self.ready_key(queue)).map_err(backend)?;
        let delayed: usize = con.zcard(self.delayed_key(queue)).map_err(backend)?;
        let running: usize = con.zcard(self.leases_key(queue)).map_err(backend)?;
        Ok(QueueDepth {
            waiting: ready + delayed,
            running,
        })
    }
}
