//! Bounded admission of concurrent object store operations.
//!
//! [`AdmissionGate`] caps the number of in-flight tasks using a tokio semaphore. A task holds a
//! [`GatePermit`] from the moment it is admitted until it finishes, and the permit is returned on
//! drop, which covers success, failure and panics alike.
//!
//! [`AdmissionGate::drain`] is the barrier between phases: it takes every permit at once, which is
//! only possible after all previously admitted tasks have finished, and hands them straight back.
//! The caller must stop submitting before draining; a drain racing with new submissions may return
//! while some of them are still running.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Interval for the periodic in-flight emitter.
const EMITTER_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for the gate capacity, as [`drain`](AdmissionGate::drain) acquires all permits in
/// one call.
const MAX_CAPACITY: usize = u32::MAX as usize;

/// Errors returned when acquiring a permit.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// The gate was closed and admits no further work.
    #[error("admission gate is closed")]
    Closed,
    /// The cancellation token fired before a permit became available.
    #[error("waiting for admission was cancelled")]
    Cancelled,
}

/// Limits the number of concurrently running tasks.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    /// Creates a gate admitting at most `capacity` tasks at a time.
    ///
    /// A capacity of zero would never admit anything and is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// The maximum number of tasks in flight.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of permits currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }

    /// Waits until a permit is available.
    ///
    /// This does not return early for any reason other than the gate being closed. Use
    /// [`acquire_until`](Self::acquire_until) to make the wait cancellable.
    pub async fn acquire(&self) -> Result<GatePermit, GateError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;

        Ok(GatePermit { _permit: permit })
    }

    /// Waits until a permit is available or `cancel` fires, whichever happens first.
    pub async fn acquire_until(&self, cancel: &CancellationToken) -> Result<GatePermit, GateError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GateError::Cancelled),
            permit = self.acquire() => permit,
        }
    }

    /// Admits `task` and spawns it onto the runtime.
    ///
    /// Only the wait for a permit can suspend the caller; spawning itself never blocks. The permit
    /// is released as soon as the task completes.
    pub async fn submit<F>(&self, task: F) -> Result<JoinHandle<F::Output>, GateError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.acquire().await?;
        Ok(tokio::spawn(permit.run(task)))
    }

    /// Admits `task` and spawns it, unless `cancel` fires while waiting for a permit.
    ///
    /// Once admitted, the task runs to completion regardless of `cancel`; tasks that should stop
    /// early must observe the token themselves.
    pub async fn submit_until<F>(
        &self,
        cancel: &CancellationToken,
        task: F,
    ) -> Result<JoinHandle<F::Output>, GateError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.acquire_until(cancel).await?;
        Ok(tokio::spawn(permit.run(task)))
    }

    /// Waits until every admitted task has released its permit.
    pub async fn drain(&self) -> Result<(), GateError> {
        // `capacity` is clamped to `MAX_CAPACITY` on construction.
        let permits = self
            .semaphore
            .acquire_many(self.capacity as u32)
            .await
            .map_err(|_| GateError::Closed)?;
        drop(permits);
        Ok(())
    }

    /// Closes the gate. Pending and future acquires fail with [`GateError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Periodically calls `emit` with the current in-flight count.
    ///
    /// This future runs forever and is intended to be spawned as a background task alongside the
    /// phase using this gate.
    pub async fn run_emitter<F, Fut>(self, mut emit: F)
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(EMITTER_INTERVAL);
        loop {
            ticker.tick().await;
            emit(self.in_flight()).await;
        }
    }
}

/// RAII guard for an admitted task.
///
/// Dropping this permit returns it to the [`AdmissionGate`].
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    /// Runs `task` to completion while holding this permit, then releases it.
    pub async fn run<F: Future>(self, task: F) -> F::Output {
        let output = task.await;
        drop(self);
        output
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let gate = AdmissionGate::new(2);
        assert_eq!(gate.in_flight(), 0);

        let p1 = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 1);

        let p2 = gate.acquire().await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        drop(p1);
        assert_eq!(gate.in_flight(), 1);

        drop(p2);
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn zero_capacity_admits_one() {
        let gate = AdmissionGate::new(0);
        assert_eq!(gate.capacity(), 1);
        let _permit = gate.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let gate = AdmissionGate::new(1);
        let permit = gate.acquire().await.unwrap();

        let mut waiting = Box::pin(gate.acquire());
        assert!(futures::poll!(&mut waiting).is_pending());

        drop(permit);
        assert!(futures::poll!(&mut waiting).is_ready());
    }

    #[tokio::test]
    async fn acquire_until_cancelled() {
        let gate = AdmissionGate::new(1);
        let _permit = gate.acquire().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = gate.acquire_until(&cancel).await;
        assert_eq!(result.unwrap_err(), GateError::Cancelled);
    }

    #[tokio::test]
    async fn submit_until_runs_admitted_task() {
        let gate = AdmissionGate::new(1);
        let cancel = CancellationToken::new();

        let handle = gate.submit_until(&cancel, async { 42 }).await.unwrap();
        assert_eq!(handle.await.unwrap(), 42);
        gate.drain().await.unwrap();
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn submit_until_cancelled_does_not_spawn() {
        let gate = AdmissionGate::new(1);
        let _permit = gate.acquire().await.unwrap();

        let cancel = CancellationToken::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = Arc::clone(&ran);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        };

        let mut submit = Box::pin(gate.submit_until(&cancel, task));
        assert!(futures::poll!(&mut submit).is_pending());

        cancel.cancel();
        assert_eq!(submit.await.unwrap_err(), GateError::Cancelled);
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn closed_gate_rejects() {
        let gate = AdmissionGate::new(1);
        gate.close();

        assert_eq!(gate.acquire().await.unwrap_err(), GateError::Closed);
        assert_eq!(gate.drain().await.unwrap_err(), GateError::Closed);
    }

    #[tokio::test]
    async fn drain_returns_immediately_when_idle() {
        let gate = AdmissionGate::new(5);
        let drain = Box::pin(gate.drain());
        assert!(futures::poll!(drain).is_ready());
    }

    #[tokio::test]
    async fn drain_waits_for_outstanding_permits() {
        let gate = AdmissionGate::new(2);
        let p1 = gate.acquire().await.unwrap();
        let p2 = gate.acquire().await.unwrap();

        let mut drain = Box::pin(gate.drain());

        // Dropping one permit is not enough.
        drop(p1);
        assert!(futures::poll!(&mut drain).is_pending());

        // Dropping the last permit should resolve it.
        drop(p2);
        assert!(futures::poll!(&mut drain).is_ready());

        // The drain hands all permits back.
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_capacity() {
        let gate = AdmissionGate::new(4);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..64 {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            gate.submit(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        gate.drain().await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn drain_waits_for_all_submitted_tasks() {
        let gate = AdmissionGate::new(3);
        let completed = Arc::new(AtomicUsize::new(0));

        for i in 0..25u64 {
            let completed = Arc::clone(&completed);
            gate.submit(async move {
                tokio::time::sleep(Duration::from_millis(i % 5)).await;
                completed.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        gate.drain().await.unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn panicking_task_releases_permit() {
        let gate = AdmissionGate::new(1);
        let handle = gate
            .submit(async { panic!("task failure") })
            .await
            .unwrap();

        assert!(handle.await.is_err());
        assert_eq!(gate.in_flight(), 0);
        gate.drain().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn emitter_calls_callback() {
        let gate = AdmissionGate::new(5);
        let _permit = gate.acquire().await.unwrap();

        let emitted = Arc::new(AtomicUsize::new(0));
        let emitted_clone = Arc::clone(&emitted);

        let emitter = gate.clone().run_emitter(move |count| {
            let emitted = Arc::clone(&emitted_clone);
            async move {
                emitted.store(count, Ordering::Relaxed);
            }
        });

        tokio::select! {
            _ = emitter => unreachable!("emitter runs forever"),
            _ = tokio::time::sleep(EMITTER_INTERVAL) => {}
        }

        assert_eq!(emitted.load(Ordering::Relaxed), 1);
    }
}
