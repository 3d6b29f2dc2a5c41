use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{self, EnvFilter};

use screener_mcp::alerts::transport::{AlertTransport, BroadcastTransport, TelegramTransport};
use screener_mcp::alerts::{AlertScheduler, Evaluator};
use screener_mcp::backtest::BacktestRunner;
use screener_mcp::cache::TtlCache;
use screener_mcp::config::Config;
use screener_mcp::context::AppContext;
use screener_mcp::market::MarketStore;
use screener_mcp::server::ScreenerServer;
use screener_mcp::store::StrategyStore;
use screener_mcp::synth::llm::{ChatModel, HttpChatModel};
use screener_mcp::synth::Synthesizer;
use screener_mcp::vocab::{self, Vocabulary};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;

    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(StrategyStore::open(&config.db_path)?);
    let market = Arc::new(MarketStore::new(config.data_dir.clone()));

    // Startup proceeds in degraded mode if some dynamic vocabulary fails to
    // load; only all three failing is fatal.
    let vocab = Arc::new(Vocabulary::new());
    vocab::init(
        &vocab,
        store.list_sectors(),
        store.list_industries(),
        market.fundamental_columns(),
    )?;

    let cache = Arc::new(TtlCache::new(Duration::from_secs(config.result_ttl_secs)));
    let model: Arc<dyn ChatModel> = Arc::new(HttpChatModel::new(&config.model)?);
    let synth = Arc::new(Synthesizer::new(
        model,
        Arc::clone(&vocab),
        Arc::clone(&store),
        Arc::clone(&cache),
        config.model.max_attempts,
    ));
    let runner = Arc::new(BacktestRunner::new(Arc::clone(&market), Arc::clone(&cache)));

    let mut transports: Vec<Arc<dyn AlertTransport>> = vec![Arc::new(BroadcastTransport::new(64))];
    if let (Some(token), Some(chat_id)) = (
        config.alerts.telegram_bot_token.clone(),
        config.alerts.telegram_chat_id.clone(),
    ) {
        transports.push(Arc::new(TelegramTransport::new(token, chat_id)?));
        tracing::info!("Telegram alert transport configured");
    }

    let shutdown = CancellationToken::new();
    let scheduler = AlertScheduler::new(
        Arc::clone(&store),
        Arc::clone(&vocab),
        Arc::clone(&runner) as Arc<dyn Evaluator>,
        transports,
        Duration::from_millis(config.alerts.tick_ms),
        shutdown.clone(),
    );
    let scheduler_handle = scheduler.spawn();

    let ctx = Arc::new(AppContext {
        vocab,
        store,
        market,
        cache,
        runner,
        synth,
        user_id: config.default_user_id,
    });

    if let Ok(port) = std::env::var("PORT") {
        // HTTP mode — used by cloud platforms
        use rmcp::transport::streamable_http_server::{
            session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
        };

        let service = StreamableHttpService::new(
            move || Ok(ScreenerServer::new(ctx.clone())),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        );

        let app = axum::Router::new()
            .nest_service("/mcp", service)
            .route("/health", axum::routing::get(|| async { "ok" }))
            .layer(tower_http::cors::CorsLayer::permissive());

        let addr = format!("0.0.0.0:{port}");
        tracing::info!("Starting screener-mcp HTTP server on {addr}");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
    } else {
        // stdio mode — used for local development with MCP clients
        tracing::info!("Starting screener-mcp MCP server (stdio)");

        let server = ScreenerServer::new(ctx);
        let service = server.serve(rmcp::transport::stdio()).await?;
        service.waiting().await?;
    }

    shutdown.cancel();
    let _ = scheduler_handle.await;
    Ok(())
}
