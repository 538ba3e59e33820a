use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::Collector;
use crate::config::LoadConfig;
use crate::queue::Queue;
use crate::sink::Sink;
use crate::task::{CategoryId, TaskPack, DEFAULT_TASK_CAPACITY};

/// Synthetic producers feeding a running collector.
///
/// Each producer puts one task per category every `period`, with every slot
/// set to the configured value, until `duration` elapses or the token is
/// cancelled. A zero duration produces until cancellation.
pub struct LoadGenerator {
    handles: Vec<JoinHandle<u64>>,
    cancel: CancellationToken,
}

impl LoadGenerator {
    /// Spawns `cfg.producers` producer tasks on the current tokio runtime.
    pub fn spawn<S, Q>(
        collector: Arc<Collector<S, Q>>,
        cfg: &LoadConfig,
        categories: Vec<CategoryId>,
        cancel: CancellationToken,
    ) -> Self
    where
        S: Sink + 'static,
        Q: Queue + 'static,
    {
        let task = TaskPack::from_values([cfg.value; DEFAULT_TASK_CAPACITY]);
        let categories: Arc<[CategoryId]> = categories.into();
        let deadline = (!cfg.duration.is_zero()).then(|| Instant::now() + cfg.duration);

        let handles = (0..cfg.producers)
            .map(|producer| {
                tokio::spawn(produce(
                    producer,
                    Arc::clone(&collector),
                    Arc::clone(&categories),
                    task,
                    cfg.period,
                    deadline,
                    cancel.clone(),
                ))
            })
            .collect();

        info!(
            producers = cfg.producers,
            period = ?cfg.period,
            duration = ?cfg.duration,
            "synthetic load started",
        );

        Self { handles, cancel }
    }

    /// Number of producers still attached.
    pub fn producers(&self) -> usize {
        self.handles.len()
    }

    /// Cancels all producers and returns the total number of tasks put.
    pub async fn stop(self) -> u64 {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for all producers to finish on their own.
    pub async fn join(self) -> u64 {
        let mut total = 0u64;
        for handle in self.handles {
            match handle.await {
                Ok(sent) => total += sent,
                Err(e) => warn!(error = %e, "load producer failed"),
            }
        }

        info!(tasks = total, "synthetic load finished");
        total
    }
}

async fn produce<S: Sink + 'static, Q: Queue + 'static>(
    producer: usize,
    collector: Arc<Collector<S, Q>>,
    categories: Arc<[CategoryId]>,
    task: TaskPack,
    period: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
) -> u64 {
    // tokio panics on a zero period.
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let expired = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expired);

    let mut sent = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut expired => break,
            _ = ticker.tick() => {
                for &category in categories.iter() {
                    collector.put(category, task);
                    sent += 1;
                }
            }
        }
    }

    debug!(producer, sent, "load producer finished");
    sent
}
