use crate::error::EngineError;
use crate::gate::RateGate;
use crate::ledger::PortfolioLedger;
use crate::locks::OperationLocks;
use crate::shutdown::{self, Shutdown, ShutdownTrigger};
use crate::worker::{MarketWorker, WorkerContext, WorkerFault, WorkerStatus};
use alerter::Alert;
use api_client::ExchangeClient;
use configuration::{Config, LockConfig, RateGateConfig, WorkerConfig};
use core_types::Market;
use std::collections::BTreeMap;
use std::sync::Arc;
use strategies::SignalProvider;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// The slices of `Config` the pool runs on.
#[derive(Debug, Clone, Default)]
pub struct PoolSettings {
    pub worker: WorkerConfig,
    pub rate_gate: RateGateConfig,
    pub locks: LockConfig,
}

impl From<&Config> for PoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            worker: config.worker.clone(),
            rate_gate: config.rate_gate.clone(),
            locks: config.locks.clone(),
        }
    }
}

#[derive(Default)]
struct PoolState {
    workers: Vec<(Market, JoinHandle<()>)>,
    status: BTreeMap<Market, watch::Receiver<WorkerStatus>>,
    faults: Option<mpsc::UnboundedSender<WorkerFault>>,
    supervisor: Option<JoinHandle<()>>,
    stopped: bool,
}

/// Runs one `MarketWorker` per market against a shared gate, lock set and ledger.
pub struct WorkerPool {
    settings: PoolSettings,
    exchange: Arc<dyn ExchangeClient>,
    signals: Arc<dyn SignalProvider>,
    ledger: Arc<PortfolioLedger>,
    alerts: broadcast::Sender<Alert>,
    gate: Arc<RateGate>,
    locks: Arc<OperationLocks>,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        settings: PoolSettings,
        exchange: Arc<dyn ExchangeClient>,
        signals: Arc<dyn SignalProvider>,
        ledger: Arc<PortfolioLedger>,
        alerts: broadcast::Sender<Alert>,
    ) -> Self {
        let (trigger, shutdown) = shutdown::channel();
        let gate = Arc::new(RateGate::new(&settings.rate_gate, shutdown.clone()));
        let locks = Arc::new(OperationLocks::new(settings.locks.max_wait(), shutdown.clone()));
        Self {
            settings,
            exchange,
            signals,
            ledger,
            alerts,
            gate,
            locks,
            trigger,
            shutdown,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn gate(&self) -> &Arc<RateGate> {
        &self.gate
    }

    pub fn locks(&self) -> &Arc<OperationLocks> {
        &self.locks
    }

    pub fn ledger(&self) -> &Arc<PortfolioLedger> {
        &self.ledger
    }

    /// Starts a worker for every market that does not have one yet and returns how
    /// many were started. Consecutive new workers have their first tick staggered.
    pub async fn start(&self, markets: &[Market]) -> Result<usize, EngineError> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(EngineError::PoolStopped);
        }

        let faults = match &state.faults {
            Some(tx) => tx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.supervisor = Some(tokio::spawn(supervise(rx, self.alerts.clone())));
                state.faults = Some(tx.clone());
                tx
            }
        };

        let mut started = 0u32;
        for market in markets {
            if state.status.contains_key(market) {
                tracing::debug!(%market, "Worker already running, skipping");
                continue;
            }
            let ctx = WorkerContext {
                gate: self.gate.clone(),
                locks: self.locks.clone(),
                ledger: self.ledger.clone(),
                exchange: self.exchange.clone(),
                signals: self.signals.clone(),
                alerts: self.alerts.clone(),
                config: self.settings.worker.clone(),
                shutdown: self.shutdown.clone(),
            };
            let (worker, status) = MarketWorker::new(market.clone(), ctx, faults.clone());
            let delay = self.settings.worker.stagger() * started;
            let handle = tokio::spawn(worker.run(delay));

            state.status.insert(market.clone(), status);
            state.workers.push((market.clone(), handle));
            started += 1;
        }

        if started > 0 {
            tracing::info!(started, total = state.status.len(), "Workers started");
            let _ = self.alerts.send(Alert::Started {
                markets: started as usize,
            });
        }
        Ok(started as usize)
    }

    /// Signals every worker to stop and waits for them. Orders already submitted
    /// are allowed to finish and are recorded before this returns.
    pub async fn stop(&self) {
        let (workers, supervisor) = {
            let mut state = self.state.lock().await;
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.faults = None;
            (std::mem::take(&mut state.workers), state.supervisor.take())
        };

        tracing::info!(workers = workers.len(), "Stopping worker pool");
        self.trigger.trigger();

        for (market, handle) in workers {
            if let Err(e) = handle.await {
                tracing::error!(%market, error = %e, "Worker task ended abnormally");
            }
        }
        // Every fault sender is gone now, so the supervisor drains and exits.
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                tracing::error!(error = %e, "Supervisor task ended abnormally");
            }
        }

        let _ = self.alerts.send(Alert::Stopped);
        tracing::info!("Worker pool stopped");
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    pub async fn status(&self) -> BTreeMap<Market, WorkerStatus> {
        self.state
            .lock()
            .await
            .status
            .iter()
            .map(|(market, rx)| (market.clone(), rx.borrow().clone()))
            .collect()
    }
}

/// Turns worker faults into critical log lines and halt alerts.
async fn supervise(mut faults: mpsc::UnboundedReceiver<WorkerFault>, alerts: broadcast::Sender<Alert>) {
    while let Some(fault) = faults.recv().await {
        tracing::error!(market = %fault.market, reason = %fault.reason, "CRITICAL: worker halted");
        let _ = alerts.send(Alert::WorkerHalted {
            market: fault.market,
            reason: fault.reason,
        });
    }
    tracing::debug!("Supervisor finished");
}
