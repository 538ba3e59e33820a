use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock;
use crate::queue::Queue;
use crate::sink::Sink;

use super::Shared;

const THREAD_NAME: &str = "perfshm-collector";

/// Clears the running flag when the worker exits for any reason, including
/// a panic in user aggregation code. Producers then stop enqueueing into a
/// queue nobody drains.
struct RunningGuard<'a> {
    running: &'a AtomicBool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            warn!("collector worker exited while running, collection disabled");
        }
    }
}

/// Spawns the collector thread.
///
/// The thread owns a current-thread tokio runtime used only for its timer:
/// the wait between ticks races the interval against `cancel`, so `stop`
/// never waits out a full interval.
pub(super) fn spawn<S, Q>(
    shared: Arc<Shared<S, Q>>,
    interval: Duration,
    cancel: CancellationToken,
) -> io::Result<JoinHandle<()>>
where
    S: Sink + 'static,
    Q: Queue + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            let _guard = RunningGuard {
                running: &shared.running,
            };

            debug!(interval = ?interval, "collector worker started");
            runtime.block_on(run_loop(&shared, interval, &cancel));
            debug!("collector worker finished");
        })
}

async fn run_loop<S: Sink, Q: Queue>(
    shared: &Shared<S, Q>,
    interval: Duration,
    cancel: &CancellationToken,
) {
    while shared.running.load(Ordering::Acquire) {
        shared.tick(clock::now_millis());

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    if !cancel.is_cancelled() && shared.running.load(Ordering::Acquire) {
        error!("collector loop ended without cancellation");
    }
}
