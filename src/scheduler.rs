//! Periodic refresh tasks, one per subscriber.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

/// Identifies one refresh task: the resource it refreshes and who asked
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub resource: &'static str,
    pub subscriber: Uuid,
}

impl TaskKey {
    pub fn new(resource: &'static str) -> Self {
        Self {
            resource,
            subscriber: Uuid::new_v4(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.resource, self.subscriber)
    }
}

type StopChans = Arc<Mutex<HashMap<TaskKey, broadcast::Sender<()>>>>;

/// Owns the stop channels of every running refresh task
#[derive(Debug, Clone, Default)]
pub struct RefreshScheduler {
    stop_chans: StopChans,
}

impl RefreshScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period`, starting one period from now, until the
    /// returned subscription is dropped or cancelled.
    pub fn subscribe<F, Fut>(&self, key: TaskKey, period: Duration, mut job: F) -> Subscription
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = broadcast::channel(1);

        {
            let mut stop_chans = self.stop_chans.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = stop_chans.insert(key.clone(), stop_tx) {
                let _ = previous.send(());
            }
        }

        debug!("Scheduler: subscribing {} every {:?}", key, period);

        let task_key = key.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                job().await;
            }

            debug!("Scheduler: refresh task {} stopped", task_key);
        });

        Subscription {
            key,
            stop_chans: Arc::clone(&self.stop_chans),
        }
    }

    /// Stop the task registered under `key`
    pub fn unsubscribe(&self, key: &TaskKey) {
        stop_task(&self.stop_chans, key);
    }

    pub fn active_tasks(&self) -> usize {
        self.stop_chans.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Stop every task, e.g. when the dashboard session ends
    pub fn stop_all(&self) {
        let mut stop_chans = self.stop_chans.lock().unwrap_or_else(PoisonError::into_inner);
        let count = stop_chans.len();
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
        if count > 0 {
            info!("Scheduler: stopped {} refresh tasks", count);
        }
    }
}

fn stop_task(stop_chans: &StopChans, key: &TaskKey) {
    let mut chans = stop_chans.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(stop_tx) = chans.remove(key) {
        let _ = stop_tx.send(());
        debug!("Scheduler: unsubscribed {}", key);
    }
}

/// Cancellation handle for a refresh task; dropping it stops the task
#[derive(Debug)]
pub struct Subscription {
    key: TaskKey,
    stop_chans: StopChans,
}

impl Subscription {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        stop_task(&self.stop_chans, &self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_every_period() {
        let scheduler = RefreshScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let _subscription = scheduler.subscribe(
            TaskKey::new("roster"),
            Duration::from_secs(30),
            counting_job(&counter),
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.active_tasks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_subscription_stops_task() {
        let scheduler = RefreshScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let subscription = scheduler.subscribe(
            TaskKey::new("site-metrics"),
            Duration::from_secs(30),
            counting_job(&counter),
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        subscription.cancel();
        assert_eq!(scheduler.active_tasks(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all() {
        let scheduler = RefreshScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let _a = scheduler.subscribe(TaskKey::new("a"), Duration::from_secs(10), counting_job(&counter));
        let _b = scheduler.subscribe(TaskKey::new("b"), Duration::from_secs(10), counting_job(&counter));
        assert_eq!(scheduler.active_tasks(), 2);

        scheduler.stop_all();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.active_tasks(), 0);
    }
}
