//! Worker pool that drains queued endpoints from the registry
//!
//! Workers are tokio tasks. Each one claims the first queued entry, runs the
//! retry policy against it and loops; when nothing is queued it exits. The
//! next start command tops the pool back up to the configured size.
//!
//! The count of live workers is changed only while the registry lock is held
//! (on claim failure and on start), so a worker that is about to exit can
//! never miss entries queued by a concurrent start.

use crate::error::ConfigError;
use crate::proxy::checker::{CheckerConfig, Probe};
use crate::proxy::registry::{EntryId, Registry};
use crate::proxy::retry::RetryPolicy;
use crate::Result;
use anyhow::Context;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Concurrent prober over a shared registry
pub struct ProbePool {
    registry: Arc<Registry>,
    probe: Arc<dyn Probe>,
    config: Arc<RwLock<CheckerConfig>>,
    live: Arc<watch::Sender<usize>>,
    runtime: Handle,
}

impl ProbePool {
    /// Create a pool bound to the current tokio runtime
    pub fn new(
        registry: Arc<Registry>,
        probe: Arc<dyn Probe>,
        config: CheckerConfig,
    ) -> Result<Self> {
        let runtime =
            Handle::try_current().context("probe pool must be created inside a tokio runtime")?;
        Self::with_runtime(registry, probe, config, runtime)
    }

    /// Create a pool that spawns its workers on `runtime`
    ///
    /// Useful when start and abort are driven from threads outside the runtime.
    pub fn with_runtime(
        registry: Arc<Registry>,
        probe: Arc<dyn Probe>,
        config: CheckerConfig,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            probe,
            config: Arc::new(RwLock::new(config)),
            live: Arc::new(watch::channel(0).0),
            runtime,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> CheckerConfig {
        self.config.read().clone()
    }

    /// Replace the operator parameters
    ///
    /// Entries already claimed keep the settings they were claimed with.
    pub fn set_config(&self, config: CheckerConfig) -> std::result::Result<(), ConfigError> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Number of workers currently alive
    pub fn live_workers(&self) -> usize {
        *self.live.borrow()
    }

    /// Queue every entry not under test and top the pool up to the
    /// configured worker count; returns the number of workers spawned
    pub fn start_testing(&self) -> usize {
        let target = self.config.read().workers;
        let live = &self.live;

        let (queued, spawn) = self.registry.requeue_all_and(|queued| {
            let current = *live.borrow();
            let shortfall = target.saturating_sub(current);
            live.send_modify(|n| *n += shortfall);
            (queued, shortfall)
        });

        for _ in 0..spawn {
            let worker = Worker {
                registry: Arc::clone(&self.registry),
                probe: Arc::clone(&self.probe),
                config: Arc::clone(&self.config),
                live: Arc::clone(&self.live),
                retired: false,
                holding: None,
            };
            self.runtime.spawn(worker.run());
        }

        tracing::info!(queued, spawned = spawn, target, "test started");
        spawn
    }

    /// Cancel queued entries; entries under test run to completion
    pub fn abort_testing(&self) -> usize {
        let cancelled = self.registry.cancel_queued();
        tracing::info!(cancelled, "test aborted");
        cancelled
    }

    /// Wait until every worker has exited
    ///
    /// Cancel-safe: dropping the future leaves the workers running.
    pub async fn wait_idle(&self) {
        let mut live = self.live.subscribe();
        // The sender lives as long as the pool, so this cannot fail.
        let _ = live.wait_for(|n| *n == 0).await;
    }
}

/// One worker task; holds a slot in the live count until it retires
struct Worker {
    registry: Arc<Registry>,
    probe: Arc<dyn Probe>,
    config: Arc<RwLock<CheckerConfig>>,
    live: Arc<watch::Sender<usize>>,
    retired: bool,
    /// Entry owned by this worker while its retry sequence runs
    holding: Option<EntryId>,
}

impl Worker {
    fn retire(&mut self) {
        self.live.send_modify(|n| *n -= 1);
        self.retired = true;
    }

    async fn run(mut self) {
        tracing::debug!("worker started");
        loop {
            let registry = Arc::clone(&self.registry);
            let Some(claim) = registry.claim_next(|| self.retire()) else {
                break;
            };
            self.holding = Some(claim.id);

            let (policy, target) = {
                let config = self.config.read();
                (
                    RetryPolicy::new(config.attempts, config.timeout),
                    config.test_url.clone(),
                )
            };

            let state = policy
                .run(
                    &self.registry,
                    claim.id,
                    &claim.endpoint,
                    self.probe.as_ref(),
                    &target,
                )
                .await;
            self.registry.release(claim.id);
            self.holding = None;
            tracing::info!(endpoint = %claim.endpoint, ?state, "endpoint tested");
        }
        tracing::debug!("worker finished, queue drained");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Task was cancelled or panicked mid-run.
        if let Some(id) = self.holding.take() {
            tracing::warn!(entry = %id, "worker dropped while owning an entry");
            self.registry.release(id);
        }
        if !self.retired {
            tracing::error!("worker exited without retiring");
            self.live.send_modify(|n| *n -= 1);
        }
    }
}
