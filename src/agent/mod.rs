pub mod load;

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::SchemaAggregator;
use crate::collector::{Collector, ThreadingMode, DEFAULT_INTERVAL_MS};
use crate::config::{Config, SinkConfig, SinkKind};
use crate::export::health::HealthMetrics;
use crate::sink::{MemorySink, SharedMemorySink, Sink};
use crate::task::CategoryId;

use self::load::LoadGenerator;

/// Collector over whichever sink the config selects.
pub type AgentCollector = Collector<Box<dyn Sink>>;

/// Agent orchestrates all components: sink, collector, health server and
/// synthetic load.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    collector: Option<Arc<AgentCollector>>,
    load: Option<LoadGenerator>,
    started_at: Option<Instant>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            collector: None,
            load: None,
            started_at: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin collecting.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during setup.
        if self.cfg.health.enabled {
            let addr = self
                .health
                .start()
                .await
                .context("starting health metrics server")?;
            info!(%addr, "health metrics server started");
        }

        // 2. Collector over the configured sink.
        warn_on_interval_fallback(&self.cfg);
        let collector = Arc::new(
            Collector::new(build_sink(&self.cfg.sink)).with_health(Arc::clone(&self.health)),
        );
        let mode = ThreadingMode::from(self.cfg.collector.mode);

        collector
            .run(
                &self.cfg.collector.sink_name,
                SchemaAggregator::new(self.cfg.metrics.clone()),
                self.cfg.interval_ms(),
                mode,
            )
            .with_context(|| format!("starting collector for {}", self.cfg.collector.sink_name))?;

        // 3. In manual mode this runtime drives the ticks.
        if mode == ThreadingMode::Manual {
            self.spawn_ticker(Arc::clone(&collector));
        }

        // 4. Synthetic load.
        if self.cfg.load.producers > 0 {
            self.load = Some(LoadGenerator::spawn(
                Arc::clone(&collector),
                &self.cfg.load,
                categories(&self.cfg),
                self.cancel.child_token(),
            ));
        }

        self.collector = Some(collector);
        self.started_at = Some(Instant::now());

        info!(
            sink = self.cfg.collector.sink_name.as_str(),
            metrics = self.cfg.metrics.len(),
            "agent fully started",
        );

        Ok(())
    }

    /// Resolves once the configured load duration has elapsed.
    ///
    /// Never resolves when the duration is zero; callers race it against a
    /// shutdown signal.
    pub async fn wait(&self) {
        let duration = self.cfg.load.duration;
        let Some(started_at) = self.started_at.filter(|_| !duration.is_zero()) else {
            return std::future::pending().await;
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(started_at + duration) => {
                info!(duration = ?duration, "load duration elapsed");
            }
        }
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Producers first so nothing is put into a stopping collector.
        if let Some(load) = self.load.take() {
            let sent = load.stop().await;
            debug!(tasks = sent, "load producers joined");
        }

        // Joining the worker thread blocks; keep it off the runtime threads.
        if let Some(collector) = self.collector.take() {
            let joined = tokio::task::spawn_blocking(move || collector.stop()).await;
            if let Err(e) = joined {
                error!(error = %e, "error stopping collector");
            }
        }

        // Stop health metrics server.
        self.health.stop();

        info!("agent stopped");

        Ok(())
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn collector(&self) -> Option<&Arc<AgentCollector>> {
        self.collector.as_ref()
    }

    /// Spawn the tick driver used in manual threading mode.
    fn spawn_ticker(&self, collector: Arc<AgentCollector>) {
        let cancel = self.cancel.clone();
        let period = std::time::Duration::from_millis(collector.interval_ms());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !collector.is_running() {
                            warn!("collector no longer running, tick driver exiting");
                            return;
                        }
                        collector.tick_now();
                    }
                }
            }
        });
    }
}

/// Builds the sink selected by the config.
pub fn build_sink(cfg: &SinkConfig) -> Box<dyn Sink> {
    match cfg.kind {
        SinkKind::SharedMemory => Box::new(SharedMemorySink::new(cfg.dir.clone(), cfg.capacity)),
        SinkKind::Memory => Box::new(MemorySink::new().with_capacity(cfg.capacity)),
    }
}

/// Logs when the configured interval is below the collector's resolution.
fn warn_on_interval_fallback(cfg: &Config) {
    if cfg.interval_falls_back() {
        warn!(
            interval = ?cfg.collector.interval,
            default_ms = DEFAULT_INTERVAL_MS,
            "collector.interval is under 1ms, the default applies",
        );
    }
}

/// Distinct category ids referenced by the metric schema, ascending.
fn categories(cfg: &Config) -> Vec<CategoryId> {
    cfg.metrics
        .iter()
        .map(|def| def.id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collector::Phase;
    use crate::config::{CollectorMode, MetricDef, MetricKind};
    use crate::sink::shm::read_snapshot;

    fn test_config(mode: CollectorMode) -> Config {
        let mut cfg = Config::default();
        cfg.sink.kind = SinkKind::Memory;
        cfg.collector.sink_name = "agent_test".to_string();
        cfg.collector.interval = Duration::from_millis(20);
        cfg.collector.mode = mode;
        cfg.load.producers = 2;
        cfg.load.period = Duration::from_millis(5);
        cfg.load.duration = Duration::from_millis(150);
        cfg
    }

    #[test]
    fn test_categories_are_distinct() {
        let mut cfg = Config::default();
        cfg.metrics.push(MetricDef::new(1, "send_packet_peak", MetricKind::Max));
        assert_eq!(categories(&cfg), vec![1, 2]);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logs_of(cfg: &Config) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || warn_on_interval_fallback(cfg));

        let bytes = logs.0.lock().clone();
        String::from_utf8(bytes).expect("utf8 logs")
    }

    #[test]
    fn test_interval_fallback_is_logged() {
        let mut cfg = Config::default();
        cfg.collector.interval = Duration::ZERO;
        let out = logs_of(&cfg);
        assert!(out.contains("WARN"), "{out}");
        assert!(out.contains("collector.interval is under 1ms"), "{out}");

        cfg.collector.interval = Duration::from_micros(500);
        assert!(logs_of(&cfg).contains("collector.interval is under 1ms"));

        cfg.collector.interval = Duration::from_millis(20);
        assert!(logs_of(&cfg).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_agent_worker_mode_flushes() {
        let mut agent = Agent::new(test_config(CollectorMode::Worker)).expect("agent");
        agent.start().await.expect("start");
        agent.wait().await;

        let health = Arc::clone(agent.health());
        let collector = Arc::clone(agent.collector().expect("collector"));
        agent.stop().await.expect("stop");

        assert!(health.tasks_enqueued.get() > 0.0);
        assert!(health.flushes.get() >= 1.0);
        assert_eq!(collector.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_agent_manual_mode_drives_ticks() {
        let mut agent = Agent::new(test_config(CollectorMode::Manual)).expect("agent");
        agent.start().await.expect("start");
        agent.wait().await;

        let health = Arc::clone(agent.health());
        agent.stop().await.expect("stop");

        assert!(health.tasks_collected.get() > 0.0);
        assert!(health.flushes.get() >= 1.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_agent_publishes_to_shared_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = test_config(CollectorMode::Worker);
        cfg.sink.kind = SinkKind::SharedMemory;
        cfg.sink.dir = dir.path().to_path_buf();
        cfg.sink.capacity = 64;
        cfg.load.value = 3;

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");
        agent.wait().await;
        let flushes = agent.health().flushes.get();
        agent.stop().await.expect("stop");

        assert!(flushes >= 1.0);
        let values = read_snapshot(dir.path(), "agent_test", Some(2)).expect("read");
        assert_eq!(values.len(), 2);
        // Every task carries 3 in each slot.
        assert_eq!(values[1] % 3, 0);
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_sink() {
        let mut cfg = test_config(CollectorMode::Manual);
        cfg.sink.kind = SinkKind::SharedMemory;
        cfg.sink.dir = "/nonexistent/perfshm".into();

        let mut agent = Agent::new(cfg).expect("agent");
        let err = agent.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("starting collector"));
        agent.stop().await.expect("stop after failed start");
    }

    #[tokio::test]
    async fn test_wait_returns_on_stop_signal() {
        let mut cfg = test_config(CollectorMode::Manual);
        cfg.load.duration = Duration::from_secs(3600);

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");
        agent.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), agent.wait())
            .await
            .expect("wait observes cancellation");
        agent.stop().await.expect("stop");
    }
}
