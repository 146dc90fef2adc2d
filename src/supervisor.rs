//! Process-level supervision of long-running consumer workers.
//!
//! The supervisor owns zero or more named, independently failable workers,
//! each on its own tokio task, plus one monitor task that restarts dead
//! workers after a cooldown. It is an explicitly constructed object handed
//! to the process entry point; starting and stopping it are the process's
//! startup and shutdown hooks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CourierError;

/// A long-running unit of work the supervisor can own.
///
/// `run` blocks until the shutdown token fires (clean stop, `Ok`) or the
/// worker exhausts its own recovery and gives up (`Err`). Either way the
/// task ends, which is what the monitor loop observes.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, shutdown: CancellationToken) -> Result<(), CourierError>;
}

/// Constructs a fresh worker instance for every (re)start.
pub type WorkerFactory = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often the monitor loop checks worker liveness.
    pub poll_interval: Duration,
    /// Bounded join when stopping a worker cooperatively.
    pub stop_timeout: Duration,
    /// Pause between stop and start inside `restart`.
    pub restart_pause: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            restart_pause: Duration::from_millis(500),
        }
    }
}

/// Read-only snapshot of one registration, computed at call time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub enabled: bool,
    pub running: bool,
    pub auto_restart: bool,
    pub restart_count: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
}

struct Registration {
    factory: WorkerFactory,
    enabled: bool,
    auto_restart: bool,
    restart_delay: Duration,
    handle: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    restart_count: u32,
    last_restart_at: Option<DateTime<Utc>>,
}

impl Registration {
    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct Inner {
    config: SupervisorConfig,
    // Single mutex guarding all registration state; every mutation and
    // every status read goes through it.
    registry: Mutex<HashMap<String, Registration>>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Adds or reconfigures a named worker. Re-registering an existing name
    /// replaces its configuration but leaves the runtime state (handle,
    /// restart bookkeeping) untouched.
    pub async fn register<F>(
        &self,
        name: impl Into<String>,
        factory: F,
        enabled: bool,
        auto_restart: bool,
        restart_delay: Duration,
    ) where
        F: Fn() -> Arc<dyn Worker> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: WorkerFactory = Arc::new(factory);
        let mut registry = self.inner.registry.lock().await;

        match registry.get_mut(&name) {
            Some(existing) => {
                existing.factory = factory;
                existing.enabled = enabled;
                existing.auto_restart = auto_restart;
                existing.restart_delay = restart_delay;
                log::info!("worker '{}' re-registered", name);
            }
            None => {
                registry.insert(
                    name.clone(),
                    Registration {
                        factory,
                        enabled,
                        auto_restart,
                        restart_delay,
                        handle: None,
                        cancel: None,
                        restart_count: 0,
                        last_restart_at: None,
                    },
                );
                log::info!("worker '{}' registered (enabled: {})", name, enabled);
            }
        }
    }

    /// Starts every enabled worker and launches the monitor loop.
    pub async fn start_all(&self) -> Result<(), CourierError> {
        let names: Vec<String> = {
            let registry = self.inner.registry.lock().await;
            registry
                .iter()
                .filter(|(_, reg)| reg.enabled)
                .map(|(name, _)| name.clone())
                .collect()
        };

        for name in names {
            self.start(&name).await?;
        }

        self.spawn_monitor().await;
        Ok(())
    }

    /// Starts one worker on a fresh task. Returns `false` without touching
    /// anything if it is already running.
    pub async fn start(&self, name: &str) -> Result<bool, CourierError> {
        let mut registry = self.inner.registry.lock().await;
        let reg = registry
            .get_mut(name)
            .ok_or_else(|| CourierError::Supervisor(format!("unknown worker '{}'", name)))?;

        Ok(self.spawn_worker(name, reg))
    }

    /// Launches a fresh worker instance for a registration the caller has
    /// locked. Returns `false` without touching anything when the worker is
    /// already running.
    fn spawn_worker(&self, name: &str, reg: &mut Registration) -> bool {
        if reg.is_running() {
            return false;
        }

        let worker = (reg.factory)();
        let token = self.inner.shutdown.child_token();
        let task_token = token.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            if let Err(e) = worker.run(task_token).await {
                log::error!("worker '{}' exited with error: {}", task_name, e);
            }
        });

        reg.handle = Some(handle);
        reg.cancel = Some(token);
        log::info!("worker '{}' started", name);
        true
    }

    /// Cooperatively stops one worker: fires its cancellation token and
    /// joins the task with a bounded timeout. A task that overruns the
    /// timeout is logged and left to finish on its own, never killed.
    /// Returns `false` if the worker was not running.
    pub async fn stop(&self, name: &str) -> Result<bool, CourierError> {
        let (handle, cancel) = {
            let mut registry = self.inner.registry.lock().await;
            let reg = registry
                .get_mut(name)
                .ok_or_else(|| CourierError::Supervisor(format!("unknown worker '{}'", name)))?;
            (reg.handle.take(), reg.cancel.take())
        };

        let Some(handle) = handle else {
            return Ok(false);
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        match tokio::time::timeout(self.inner.config.stop_timeout, handle).await {
            Ok(Ok(())) => log::info!("worker '{}' stopped", name),
            Ok(Err(e)) => log::warn!("worker '{}' task failed during stop: {}", name, e),
            Err(_) => log::warn!(
                "worker '{}' did not stop within {:?}",
                name,
                self.inner.config.stop_timeout
            ),
        }
        Ok(true)
    }

    /// Stop followed by a short pause and a fresh start.
    pub async fn restart(&self, name: &str) -> Result<(), CourierError> {
        self.stop(name).await?;
        tokio::time::sleep(self.inner.config.restart_pause).await;
        self.start(name).await?;
        Ok(())
    }

    /// Signals shutdown, stops every running worker, and waits for the
    /// monitor loop to exit.
    pub async fn stop_all(&self) {
        self.inner.shutdown.cancel();

        let names: Vec<String> = {
            let registry = self.inner.registry.lock().await;
            registry.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.stop(&name).await {
                log::warn!("stopping '{}' failed: {}", name, e);
            }
        }

        let monitor = self.inner.monitor.lock().await.take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }
        log::info!("supervisor shut down");
    }

    /// Per-worker status, reflecting task liveness at call time.
    pub async fn get_status(&self) -> BTreeMap<String, WorkerStatus> {
        let registry = self.inner.registry.lock().await;
        registry
            .iter()
            .map(|(name, reg)| {
                (
                    name.clone(),
                    WorkerStatus {
                        enabled: reg.enabled,
                        running: reg.is_running(),
                        auto_restart: reg.auto_restart,
                        restart_count: reg.restart_count,
                        last_restart_at: reg.last_restart_at,
                    },
                )
            })
            .collect()
    }

    async fn spawn_monitor(&self) {
        let mut monitor = self.inner.monitor.lock().await;
        if monitor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let supervisor = self.clone();
        *monitor = Some(tokio::spawn(async move {
            supervisor.monitor_loop().await;
        }));
    }

    /// Liveness sweep: restarts dead `auto_restart` workers whose cooldown
    /// has elapsed. Exits promptly on the shared shutdown signal.
    async fn monitor_loop(&self) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.poll_interval) => {}
            }

            let mut registry = self.inner.registry.lock().await;
            let now = Utc::now();
            for (name, reg) in registry.iter_mut() {
                if !reg.enabled || !reg.auto_restart {
                    continue;
                }
                // Only workers that were started and whose task has since
                // ended count as dead.
                if !reg.handle.as_ref().is_some_and(|h| h.is_finished()) {
                    continue;
                }
                if !cooldown_elapsed(reg.last_restart_at, reg.restart_delay, now) {
                    continue;
                }

                log::warn!("worker '{}' found dead, restarting", name);
                // The restart and its bookkeeping share one lock
                // acquisition, so a manual start in between cannot be
                // counted as a monitor restart.
                if self.spawn_worker(name, reg) {
                    reg.restart_count += 1;
                    reg.last_restart_at = Some(now);
                }
            }
        }
        log::info!("supervisor monitor loop exited");
    }
}

fn cooldown_elapsed(
    last_restart_at: Option<DateTime<Utc>>,
    restart_delay: Duration,
    now: DateTime<Utc>,
) -> bool {
    match last_restart_at {
        None => true,
        Some(at) => now
            .signed_duration_since(at)
            .to_std()
            .map_or(true, |elapsed| elapsed >= restart_delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Runs until cancelled.
    struct Steady;

    #[async_trait]
    impl Worker for Steady {
        async fn run(&self, shutdown: CancellationToken) -> Result<(), CourierError> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    /// Exits immediately on its first run, then behaves like `Steady`.
    struct DiesOnce {
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Worker for DiesOnce {
        async fn run(&self, shutdown: CancellationToken) -> Result<(), CourierError> {
            if self.runs.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(CourierError::Delivery("simulated crash".to_string()));
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_millis(500),
            restart_pause: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let supervisor = WorkerSupervisor::new(fast_config());
        supervisor
            .register("mailer", || Arc::new(Steady), true, false, Duration::ZERO)
            .await;

        assert!(supervisor.start("mailer").await.unwrap());
        assert!(!supervisor.start("mailer").await.unwrap());

        let status = supervisor.get_status().await;
        assert!(status["mailer"].running);

        assert!(supervisor.stop("mailer").await.unwrap());
        assert!(!supervisor.stop("mailer").await.unwrap());
        assert!(!supervisor.get_status().await["mailer"].running);
    }

    #[tokio::test]
    async fn unknown_worker_name_is_an_error() {
        let supervisor = WorkerSupervisor::new(fast_config());
        assert!(matches!(
            supervisor.start("nope").await,
            Err(CourierError::Supervisor(_))
        ));
        assert!(matches!(
            supervisor.stop("nope").await,
            Err(CourierError::Supervisor(_))
        ));
    }

    #[tokio::test]
    async fn stop_all_stops_every_worker_and_the_monitor() {
        let supervisor = WorkerSupervisor::new(fast_config());
        supervisor
            .register("w1", || Arc::new(Steady), true, true, Duration::ZERO)
            .await;
        supervisor
            .register("w2", || Arc::new(Steady), true, true, Duration::ZERO)
            .await;

        supervisor.start_all().await.unwrap();
        let status = supervisor.get_status().await;
        assert!(status["w1"].running && status["w2"].running);

        supervisor.stop_all().await;
        let status = supervisor.get_status().await;
        assert!(status.values().all(|s| !s.running));
        assert!(supervisor.inner.monitor.lock().await.is_none());
    }

    #[tokio::test]
    async fn disabled_workers_are_skipped_by_start_all() {
        let supervisor = WorkerSupervisor::new(fast_config());
        supervisor
            .register("on", || Arc::new(Steady), true, false, Duration::ZERO)
            .await;
        supervisor
            .register("off", || Arc::new(Steady), false, false, Duration::ZERO)
            .await;

        supervisor.start_all().await.unwrap();
        let status = supervisor.get_status().await;
        assert!(status["on"].running);
        assert!(!status["off"].running);
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn dead_worker_is_restarted_once_and_sibling_untouched() {
        let supervisor = WorkerSupervisor::new(fast_config());
        let runs = Arc::new(AtomicU32::new(0));
        let factory_runs = runs.clone();
        supervisor
            .register(
                "w1",
                move || {
                    Arc::new(DiesOnce {
                        runs: factory_runs.clone(),
                    })
                },
                true,
                true,
                Duration::from_millis(10),
            )
            .await;
        supervisor
            .register("w2", || Arc::new(Steady), true, true, Duration::ZERO)
            .await;

        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let status = supervisor.get_status().await;
        assert_eq!(status["w1"].restart_count, 1);
        assert!(status["w1"].running);
        assert!(status["w1"].last_restart_at.is_some());
        assert_eq!(status["w2"].restart_count, 0);
        assert!(status["w2"].running);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn manual_start_of_a_dead_worker_is_not_counted_as_a_monitor_restart() {
        let config = SupervisorConfig {
            poll_interval: Duration::from_millis(50),
            ..fast_config()
        };
        let supervisor = WorkerSupervisor::new(config);
        let runs = Arc::new(AtomicU32::new(0));
        let factory_runs = runs.clone();
        supervisor
            .register(
                "mailer",
                move || {
                    Arc::new(DiesOnce {
                        runs: factory_runs.clone(),
                    })
                },
                true,
                true,
                Duration::ZERO,
            )
            .await;

        // First run dies immediately; revive it by hand before the monitor's
        // first sweep.
        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(supervisor.start("mailer").await.unwrap());

        // Let several sweeps pass over the now-running worker.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let status = supervisor.get_status().await;
        assert!(status["mailer"].running);
        assert_eq!(status["mailer"].restart_count, 0);
        assert!(status["mailer"].last_restart_at.is_none());
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn reregister_replaces_configuration_not_runtime_state() {
        let supervisor = WorkerSupervisor::new(fast_config());
        supervisor
            .register("mailer", || Arc::new(Steady), true, true, Duration::ZERO)
            .await;
        supervisor.start("mailer").await.unwrap();

        supervisor
            .register("mailer", || Arc::new(Steady), false, false, Duration::ZERO)
            .await;

        let status = supervisor.get_status().await;
        assert!(status["mailer"].running);
        assert!(!status["mailer"].enabled);
        assert!(!status["mailer"].auto_restart);
        supervisor.stop("mailer").await.unwrap();
    }

    #[tokio::test]
    async fn restart_builds_a_fresh_instance() {
        let supervisor = WorkerSupervisor::new(fast_config());
        let built = Arc::new(AtomicU32::new(0));
        let factory_built = built.clone();
        supervisor
            .register(
                "mailer",
                move || {
                    factory_built.fetch_add(1, Ordering::SeqCst);
                    Arc::new(Steady)
                },
                true,
                false,
                Duration::ZERO,
            )
            .await;

        supervisor.start("mailer").await.unwrap();
        supervisor.restart("mailer").await.unwrap();

        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert!(supervisor.get_status().await["mailer"].running);
        supervisor.stop("mailer").await.unwrap();
    }
}
