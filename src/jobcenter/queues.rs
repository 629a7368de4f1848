use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobcenter::max_heap::JobHeap;


#[derive(Debug, PartialEq)]
pub struct Job {
    pub id: u64,
    pub priority: i64,
    pub content: Value,
    pub queue: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    Aborted,
    /// the job is checked out to a different client
    NotHolder,
    NoSuchJob,
}

/// The coordinator for all queues. One plain mutex serializes every
///  mutation; nothing is timer-driven here, so an actor would buy nothing
///  over the lock.
///
/// Invariant: a live job id is in exactly one place, either a heap (and
///  then also in `job_locations`) or in `held`.
pub struct QueueManager {
    inner: Mutex<Inner>,
    job_available: Notify,
}

#[derive(Default)]
struct Inner {
    queues: FxHashMap<String, JobHeap>,
    /// queue name per queued (not held) job id, kept in sync with the heaps
    job_locations: FxHashMap<u64, String>,
    held: FxHashMap<u64, HeldJob>,
    next_id: u64,
}

struct HeldJob {
    job: Arc<Job>,
    holder: Uuid,
}

impl Inner {
    fn requeue(&mut self, job: Arc<Job>) {
        self.job_locations.insert(job.id, job.queue.clone());
        self.queues.entry(job.queue.clone()).or_default().push(job);
    }
}

impl QueueManager {
    pub fn new() -> QueueManager {
        QueueManager {
            inner: Mutex::new(Inner::default()),
            job_available: Notify::new(),
        }
    }

    pub fn put(&self, queue: &str, priority: i64, content: Value) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        let job = Arc::new(Job { id, priority, content, queue: queue.to_string() });
        inner.queues.entry(queue.to_string()).or_default().push(job);
        inner.job_locations.insert(id, queue.to_string());
        drop(inner);

        self.job_available.notify_waiters();
        id
    }

    /// Pops the highest-priority job across the named queues and checks it
    ///  out to `client`. Equal heads go to the queue named first.
    pub fn try_claim(&self, queues: &[String], client: Uuid) -> Option<Arc<Job>> {
        let mut inner = self.inner.lock().unwrap();

        let mut best: Option<(i64, &String)> = None;
        for name in queues {
            let Some(heap) = inner.queues.get(name) else { continue };
            let Some(head) = heap.peek() else { continue };
            match best {
                Some((best_priority, _)) if head.priority <= best_priority => {}
                _ => best = Some((head.priority, name)),
            }
        }

        let (_, name) = best?;
        let job = inner.queues.get_mut(name)?.pop()?;
        inner.job_locations.remove(&job.id);
        inner.held.insert(job.id, HeldJob { job: job.clone(), holder: client });
        debug!("job {} checked out to {}", job.id, client);
        Some(job)
    }

    /// Blocks until one of the queues can supply a job. Wake-ups are
    ///  conservative: every waiter re-races under the lock and the losers
    ///  go back to sleep.
    pub async fn claim_waiting(&self, queues: &[String], client: Uuid) -> Arc<Job> {
        loop {
            let notified = self.job_available.notified();
            if let Some(job) = self.try_claim(queues, client) {
                return job;
            }
            notified.await;
        }
    }

    /// Deletes a job wherever it lives, queued or checked out to any client.
    pub fn delete(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.job_locations.remove(&id) {
            let deleted = inner.queues.get_mut(&queue).map(|heap| heap.delete(id)).unwrap_or(false);
            if !deleted {
                warn!("job {} was indexed under queue {:?} but not present in it", id, queue);
            }
            return true;
        }
        inner.held.remove(&id).is_some()
    }

    pub fn abort(&self, id: u64, client: Uuid) -> AbortOutcome {
        let mut inner = self.inner.lock().unwrap();
        match inner.held.remove(&id) {
            Some(held) if held.holder == client => {
                inner.requeue(held.job);
                drop(inner);
                self.job_available.notify_waiters();
                AbortOutcome::Aborted
            }
            Some(held) => {
                // someone else is working it; put it back untouched
                inner.held.insert(id, held);
                AbortOutcome::NotHolder
            }
            // a job that is queued (or gone) is not aborted by anyone
            None => AbortOutcome::NoSuchJob,
        }
    }

    /// Disconnect discipline: everything the client had checked out goes
    ///  back to its original queue.
    pub fn release_client(&self, client: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        let held_ids: Vec<u64> = inner
            .held
            .iter()
            .filter(|(_, held)| held.holder == client)
            .map(|(&id, _)| id)
            .collect();
        if held_ids.is_empty() {
            return;
        }

        debug!("returning {} jobs held by departed client {}", held_ids.len(), client);
        for id in held_ids {
            if let Some(held) = inner.held.remove(&id) {
                inner.requeue(held.job);
            }
        }
        drop(inner);

        self.job_available.notify_waiters();
    }
}
