//! Alert scheduler: a single periodic tick that re-evaluates alert-active
//! strategies, diffs against each strategy's prior firing set, and
//! dispatches one notification per new instance.
//!
//! At most one evaluation runs per strategy at a time; a tick that finds an
//! evaluation still in flight skips that strategy. Dispatch is parallel per
//! alert and append-only: it never touches the scheduler's bookkeeping.

pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::backtest::{millis_to_iso, BacktestResult, BacktestRunner};
use crate::derive::instance_token;
use crate::error::Result;
use crate::store::{Strategy, StrategyStore};
use crate::vocab::Vocabulary;

use transport::{AlertMessage, AlertTransport};

/// One strategy evaluation. The runner implements this; tests substitute
/// slow or scripted evaluators.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(
        &self,
        strategy: &Strategy,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult>;
}

#[async_trait]
impl Evaluator for BacktestRunner {
    async fn evaluate(
        &self,
        strategy: &Strategy,
        cancel: &CancellationToken,
    ) -> Result<BacktestResult> {
        self.run(strategy.user_id, strategy.id, &strategy.spec, cancel)
            .await
    }
}

pub struct AlertScheduler {
    store: Arc<StrategyStore>,
    vocab: Arc<Vocabulary>,
    evaluator: Arc<dyn Evaluator>,
    transports: Vec<Arc<dyn AlertTransport>>,
    in_flight: Arc<DashMap<i64, ()>>,
    tick: Duration,
    cancel: CancellationToken,
}

impl AlertScheduler {
    pub fn new(
        store: Arc<StrategyStore>,
        vocab: Arc<Vocabulary>,
        evaluator: Arc<dyn Evaluator>,
        transports: Vec<Arc<dyn AlertTransport>>,
        tick: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            vocab,
            evaluator,
            transports,
            in_flight: Arc::new(DashMap::new()),
            tick,
            cancel,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(tick_ms = self.tick.as_millis() as u64, "alert scheduler started");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("alert scheduler stopped");
                    return;
                }
                _ = interval.tick() => self.tick_once(),
            }
        }
    }

    /// One tick: start an evaluation task for every active strategy that
    /// doesn't already have one running.
    fn tick_once(&self) {
        let strategies = match self.store.list_alert_active(&self.vocab) {
            Ok(strategies) => strategies,
            Err(e) => {
                tracing::warn!(error = %e, "cannot list alert-active strategies");
                return;
            }
        };

        for strategy in strategies {
            match self.in_flight.entry(strategy.id) {
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(());
                }
            }

            let guard = InFlightGuard {
                map: Arc::clone(&self.in_flight),
                id: strategy.id,
            };
            let store = Arc::clone(&self.store);
            let evaluator = Arc::clone(&self.evaluator);
            let transports = self.transports.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) =
                    evaluate_strategy(&store, evaluator.as_ref(), &transports, &strategy, &cancel)
                        .await
                {
                    tracing::warn!(
                        strategy_id = strategy.id,
                        error = %e,
                        "alert evaluation failed"
                    );
                }
            });
        }
    }
}

/// Clears the in-flight slot when the evaluation task ends, panics
/// included.
struct InFlightGuard {
    map: Arc<DashMap<i64, ()>>,
    id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

/// Re-run the strategy, diff against the stored firing set, dispatch each
/// new instance, and extend the set.
async fn evaluate_strategy(
    store: &StrategyStore,
    evaluator: &dyn Evaluator,
    transports: &[Arc<dyn AlertTransport>],
    strategy: &Strategy,
    cancel: &CancellationToken,
) -> Result<()> {
    let result = evaluator.evaluate(strategy, cancel).await?;
    let previous = store.firing_keys(strategy.id)?;

    let mut alerts = Vec::new();
    for instance in &result.instances {
        let key = instance_token(instance);
        if previous.contains(&key) {
            continue;
        }
        let ticker = instance
            .get("ticker")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();
        let timestamp_ms = instance
            .get("timestamp")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0);
        alerts.push(AlertMessage {
            strategy_id: strategy.id,
            user_id: strategy.user_id,
            strategy_name: strategy.name.clone(),
            ticker: ticker.clone(),
            timestamp_ms,
            instance_key: key,
            text: format!(
                "{}: new instance {ticker} at {}",
                strategy.name,
                millis_to_iso(timestamp_ms)
            ),
        });
    }

    if alerts.is_empty() {
        return Ok(());
    }
    tracing::info!(
        strategy_id = strategy.id,
        new_instances = alerts.len(),
        "dispatching alerts"
    );

    futures::future::join_all(
        alerts
            .iter()
            .map(|alert| dispatch_one(transports, alert)),
    )
    .await;

    for alert in &alerts {
        store.record_alert(
            strategy.id,
            strategy.user_id,
            &alert.ticker,
            alert.timestamp_ms,
            &alert.text,
        )?;
    }
    let keys: Vec<String> = alerts.into_iter().map(|a| a.instance_key).collect();
    store.add_firings(strategy.id, &keys)?;
    Ok(())
}

/// Send one alert to every transport; failures are logged and do not block
/// the other sends.
async fn dispatch_one(transports: &[Arc<dyn AlertTransport>], alert: &AlertMessage) {
    let sends = transports.iter().map(|transport| {
        let transport = Arc::clone(transport);
        async move {
            if let Err(e) = transport.send(alert).await {
                tracing::error!(
                    transport = transport.name(),
                    strategy_id = alert.strategy_id,
                    error = %e,
                    "alert dispatch failed"
                );
            }
        }
    });
    futures::future::join_all(sends).await;
}
