//! Process-wide application context: the vocabulary registry, stores,
//! cache, runner, and synthesizer, owned as values rather than globals.

use std::sync::Arc;

use crate::backtest::BacktestRunner;
use crate::cache::TtlCache;
use crate::market::MarketStore;
use crate::store::StrategyStore;
use crate::synth::Synthesizer;
use crate::vocab::Vocabulary;

pub struct AppContext {
    pub vocab: Arc<Vocabulary>,
    pub store: Arc<StrategyStore>,
    pub market: Arc<MarketStore>,
    pub cache: Arc<TtlCache>,
    pub runner: Arc<BacktestRunner>,
    pub synth: Arc<Synthesizer>,
    /// The principal this server instance acts as. Authentication is an
    /// external collaborator; the store still checks ownership per row.
    pub user_id: i64,
}
