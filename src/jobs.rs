use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::trace;
use tokio::sync::{mpsc, oneshot};

// The foundational primitive bridging callback-style platform events into
// awaitable workflows: a waiter registers a job under some correlation key
// (a permission id, a device address, ...) and suspends on the returned
// handle; whichever component receives the corresponding platform event
// later drains the jobs queued under that key and resolves each one.

/// A zero-argument deferred computation attached to a pending job, to be run
/// by whoever resolves the job once its gating event has arrived.
pub type JobTask<T> = Box<dyn FnOnce() -> BoxFuture<'static, T> + Send>;

/// Convenience for jobs that are pure waits with no deferred work attached.
pub fn noop_task() -> JobTask<()> {
    Box::new(|| futures::future::ready(()).boxed())
}

/// The job never resolved within the waiter's timeout bound (or its registry
/// went away before resolving it). This is an observation made by the waiter
/// only; the registry side may still resolve the job later, which is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Timed out waiting for a pending job to resolve")]
pub struct JobTimeout;

/// The waiter's end of a registered job.
pub struct JobHandle<V> {
    completion: oneshot::Receiver<V>,
}

impl<V> JobHandle<V> {
    /// Suspends the calling workflow until the job is resolved, or until
    /// `timeout` expires. Only ever blocks the caller, never the registry.
    pub async fn await_result(self, timeout: Duration) -> std::result::Result<V, JobTimeout> {
        match tokio::time::timeout(timeout, self.completion).await {
            Ok(Ok(value)) => Ok(value),
            // The registry (or whoever drained the job) went away without
            // resolving it, which the waiter can't distinguish from the
            // event simply never arriving.
            Ok(Err(_closed)) => Err(JobTimeout),
            Err(_elapsed) => Err(JobTimeout),
        }
    }
}

/// The registry's end of a registered job: the deferred task plus the
/// single-use completion slot feeding the waiter.
///
/// Resolving consumes the job, so double-resolution is unrepresentable.
/// Resolving after the waiter gave up (timed out and dropped its handle)
/// quietly goes nowhere.
pub struct PendingJob<T, V> {
    task: JobTask<T>,
    completion: oneshot::Sender<V>,
}

impl<T, V> PendingJob<T, V> {
    /// Runs the deferred task, handing back its result together with the
    /// resolver for the completion slot. Split like this because some
    /// resolvers (e.g. pairing PIN delivery) need to act on the task's
    /// result before deciding what to deliver to the waiter.
    pub async fn run(self) -> (T, JobResolver<V>) {
        let value = (self.task)().await;
        (value,
         JobResolver { completion: self.completion })
    }

    /// Resolves the completion slot without running the task.
    pub fn resolve(self, value: V) {
        let _ = self.completion.send(value);
    }
}

pub struct JobResolver<V> {
    completion: oneshot::Sender<V>,
}

impl<V> JobResolver<V> {
    pub fn resolve(self, value: V) {
        let _ = self.completion.send(value);
    }
}

enum Command<K, T, V> {
    Register {
        key: K,
        job: PendingJob<T, V>,
    },
    Consume {
        key: K,
        reply: oneshot::Sender<Vec<PendingJob<T, V>>>,
    },
}

/// A registry of pending jobs keyed by a correlation key `K`.
///
/// All bookkeeping lives on a single task spawned by `new()` which processes
/// registration and drain commands strictly in submission order, so
/// concurrent registrations and drains never race and jobs under the same
/// key come back out in FIFO order. The registry task exits once every
/// clone of the registry has been dropped.
pub struct JobRegistry<K, T, V> {
    commands: mpsc::UnboundedSender<Command<K, T, V>>,
}

impl<K, T, V> Clone for JobRegistry<K, T, V> {
    fn clone(&self) -> Self {
        Self { commands: self.commands.clone() }
    }
}

impl<K, T, V> JobRegistry<K, T, V>
    where K: Eq + Hash + Send + 'static,
          T: Send + 'static,
          V: Send + 'static
{
    pub fn new() -> Self {
        let (commands, mut command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut queues: HashMap<K, VecDeque<PendingJob<T, V>>> = HashMap::new();
            while let Some(command) = command_rx.recv().await {
                match command {
                    Command::Register { key, job } => {
                        queues.entry(key).or_default().push_back(job);
                    }
                    Command::Consume { key, reply } => {
                        // Keys are unbounded (device addresses), so forget
                        // the entry rather than keeping an empty queue
                        let jobs = match queues.remove(&key) {
                            Some(queue) => queue.into_iter().collect(),
                            None => vec![],
                        };
                        let _ = reply.send(jobs);
                    }
                }
            }
            trace!("Exiting job registry task since the registry has been dropped");
        });

        Self { commands }
    }

    /// Creates a completion slot, enqueues the job under `key` and returns
    /// the waiter's handle.
    pub fn register_job(&self, key: K, task: JobTask<T>) -> JobHandle<V> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let job = PendingJob { task,
                               completion: completion_tx };
        // If the registry task is gone the handle will simply observe a
        // timeout, matching the never-resolved case.
        let _ = self.commands.send(Command::Register { key, job });
        JobHandle { completion: completion_rx }
    }

    /// Atomically drains and returns every job queued under `key` (empty if
    /// none), for the caller to resolve each one exactly once.
    pub async fn consume_jobs(&self, key: K) -> Vec<PendingJob<T, V>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands
               .send(Command::Consume { key, reply: reply_tx })
               .is_err()
        {
            return vec![];
        }
        reply_rx.await.unwrap_or_default()
    }
}

impl<K, T, V> Default for JobRegistry<K, T, V>
    where K: Eq + Hash + Send + 'static,
          T: Send + 'static,
          V: Send + 'static
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolved_job_delivers_value() {
        let registry: JobRegistry<&str, (), u32> = JobRegistry::new();
        let handle = registry.register_job("key", noop_task());

        let jobs = registry.consume_jobs("key").await;
        assert_eq!(jobs.len(), 1);
        for job in jobs {
            job.resolve(7);
        }

        assert_eq!(handle.await_result(Duration::from_secs(1)).await, Ok(7));
    }

    #[tokio::test]
    async fn jobs_drain_in_fifo_order() {
        let registry: JobRegistry<&str, u32, u32> = JobRegistry::new();
        let mut handles = vec![];
        for i in 0..3u32 {
            let task: JobTask<u32> = Box::new(move || async move { i }.boxed());
            handles.push(registry.register_job("key", task));
        }

        let jobs = registry.consume_jobs("key").await;
        assert_eq!(jobs.len(), 3);
        for (i, job) in jobs.into_iter().enumerate() {
            let (value, resolver) = job.run().await;
            assert_eq!(value, i as u32);
            resolver.resolve(value);
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await_result(Duration::from_secs(1)).await,
                       Ok(i as u32));
        }

        // A drained key is forgotten entirely
        assert!(registry.consume_jobs("key").await.is_empty());
    }

    #[tokio::test]
    async fn drained_keys_can_be_reused() {
        let registry: JobRegistry<String, (), u32> = JobRegistry::new();
        let first = registry.register_job("00:1F:32:98:12:AB".to_string(), noop_task());
        for job in registry.consume_jobs("00:1F:32:98:12:AB".to_string()).await {
            job.resolve(1);
        }
        assert_eq!(first.await_result(Duration::from_secs(1)).await, Ok(1));

        // Registration under a previously drained key starts a fresh queue
        let second = registry.register_job("00:1F:32:98:12:AB".to_string(), noop_task());
        let jobs = registry.consume_jobs("00:1F:32:98:12:AB".to_string()).await;
        assert_eq!(jobs.len(), 1);
        for job in jobs {
            job.resolve(2);
        }
        assert_eq!(second.await_result(Duration::from_secs(1)).await, Ok(2));
    }

    #[tokio::test]
    async fn consuming_an_unknown_key_returns_nothing() {
        let registry: JobRegistry<&str, (), bool> = JobRegistry::new();
        assert!(registry.consume_jobs("nobody-registered-this").await.is_empty());
    }

    #[tokio::test]
    async fn timeout_is_observed_and_late_resolution_is_a_noop() {
        let registry: JobRegistry<&str, (), bool> = JobRegistry::new();
        let handle = registry.register_job("key", noop_task());

        let outcome = handle.await_result(Duration::from_millis(20)).await;
        assert_eq!(outcome, Err(JobTimeout));

        // The job is still queued (timeout expiry doesn't touch the
        // registry's bookkeeping) and resolving it after the waiter gave up
        // must not panic or go anywhere.
        let jobs = registry.consume_jobs("key").await;
        assert_eq!(jobs.len(), 1);
        for job in jobs {
            job.resolve(true);
        }
    }
}
