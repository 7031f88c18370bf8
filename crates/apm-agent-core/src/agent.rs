//! Agent construction and the transaction factory.
//!
//! One [`Agent`] per process holds everything transactions share: the
//! resolved configuration, the attribute filter, the adaptive sampler,
//! the harvest buffers and the instrumentation registry. Transactions
//! themselves are independent values; the agent only hands them their
//! shared handles and a forked random state.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::attributes::filter::AttributeFilter;
use crate::config::Config;
use crate::harvest::{Collector, Harvester, HarvestState};
use crate::instrumentation::{Registry, Wrapper};
use crate::traces::propagation::Propagation;
use crate::traces::sampler::AdaptiveSampler;
use crate::transaction::Transaction;

pub struct Agent {
    config: Arc<Config>,
    propagation: Arc<Propagation>,
    harvest: Arc<HarvestState>,
    filter: Arc<AttributeFilter>,
    sampler: Arc<Mutex<AdaptiveSampler>>,
    /// Master random state; every transaction gets a fork so concurrent
    /// starts never contend on one generator for long.
    rng: Mutex<fastrand::Rng>,
    instrumentation: Mutex<Registry>,
}

impl Agent {
    #[must_use]
    pub fn new(config: Config) -> Agent {
        let config = Arc::new(config);
        let propagation = Arc::new(Propagation::new(&config));
        let harvest = Arc::new(HarvestState::from_config(&config));
        let filter = Arc::new(AttributeFilter::from_config(&config));
        let sampler = Arc::new(Mutex::new(AdaptiveSampler::new(
            config.sampling_target,
            config.report_period(),
        )));
        info!(
            "agent initialized app_name={} distributed_tracing={}",
            config.app_name, config.distributed_tracing_enabled
        );
        Agent {
            config,
            propagation,
            harvest,
            filter,
            sampler,
            rng: Mutex::new(fastrand::Rng::new()),
            instrumentation: Mutex::new(Registry::new()),
        }
    }

    /// Builds the agent from `APM_`-prefixed environment variables.
    #[must_use]
    pub fn from_env() -> Agent {
        crate::log_build_info();
        Agent::new(Config::from_env())
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared harvest buffers, for hosts that drive their own cycle
    /// instead of spawning [`Agent::spawn_harvester`].
    #[must_use]
    pub fn harvest_state(&self) -> Arc<HarvestState> {
        Arc::clone(&self.harvest)
    }

    /// Starts an independent transaction. The caller owns it and threads
    /// it through the request explicitly.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn start_transaction(&self, name: &str) -> Transaction {
        let rng = self.rng.lock().expect("lock poisoned").fork();
        Transaction::new(
            name,
            Arc::clone(&self.config),
            Arc::clone(&self.propagation),
            Arc::clone(&self.harvest),
            Arc::clone(&self.filter),
            Arc::clone(&self.sampler),
            rng,
        )
    }

    /// Registers an instrumentation wrapper. Startup-time only; see
    /// [`crate::instrumentation`].
    #[allow(clippy::expect_used)]
    pub fn register_instrumentation(&self, library: &str, symbol: &str, wrapper: Wrapper) {
        self.instrumentation
            .lock()
            .expect("lock poisoned")
            .register(library, symbol, wrapper);
    }

    /// Resolves a registered wrapper handle for a call site.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn resolve_instrumentation(&self, library: &str, symbol: &str) -> Option<Wrapper> {
        self.instrumentation
            .lock()
            .expect("lock poisoned")
            .resolve(library, symbol)
    }

    /// Spawns the harvest loop on the current tokio runtime. The returned
    /// handle completes after the cancellation token fires and the final
    /// window has been offered to the collector.
    pub fn spawn_harvester(
        &self,
        collector: Arc<dyn Collector>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let harvester = Harvester::new(
            Arc::clone(&self.harvest),
            collector,
            &self.config,
            cancel,
        );
        tokio::spawn(harvester.run())
    }
}
