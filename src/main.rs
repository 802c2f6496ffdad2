// =============================================================================
// DCA Engine — Main Entry Point
// =============================================================================
//
// Boots config, opens the shared balance/decision WALs, wires one
// `DcaStrategy` per configured pair atop a `SimulateTrader`, spawns a
// fixed-interval worker per pair, and serves the HTTP surface.
// =============================================================================

mod api;
mod app_state;
mod balance_log;
mod clock;
mod config;
mod decimal;
mod decision_log;
mod event_log;
mod journal;
mod reconcile;
mod series;
mod simulate;
mod strategy;
mod trader;
mod wal;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::balance_log::{BalanceLog, BalanceSnapshot};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::decimal::{Action, Decimal};
use crate::decision_log::{Decision, DecisionLog};
use crate::simulate::SimulateTrader;
use crate::strategy::{DcaStrategy, StrategyConfig, TickOutcome};
use crate::wal::Wal;

const CONFIG_PATH: &str = "config.json";
const STARTING_WALLET_QUOTE: &str = "10000";
const SEED_PRICE: &str = "100";
const PRICE_WALK_PERCENT: &str = "2";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting dca engine");

    let config = Config::load(CONFIG_PATH)?;
    std::fs::create_dir_all(&config.state_dir)?;

    let shutdown = CancellationToken::new();
    let clock = Arc::new(SystemClock) as Arc<dyn crate::clock::Clock>;

    let balance_wal = Arc::new(Wal::open(
        config.state_dir.join("balance_log"),
        config.segment_threshold,
        config.max_segments,
        true,
    )?);
    let decision_wal = Arc::new(Wal::open(
        config.state_dir.join("decision_log"),
        config.segment_threshold,
        config.max_segments,
        true,
    )?);
    let balance_log = Arc::new(BalanceLog::open(balance_wal));
    let decision_log = Arc::new(DecisionLog::open(decision_wal));

    let state = Arc::new(
        AppState::new(balance_log.clone(), decision_log.clone()).with_sse_tuning(
            Duration::from_secs(config.sse_poll_interval_secs),
            Duration::from_secs(config.sse_heartbeat_interval_secs),
            config.snapshot_thinning_keep_recent,
        ),
    );

    if config.pairs.is_empty() {
        warn!("no pairs configured; the http surface will serve with nothing trading");
    }

    let trader_state_dir = config.state_dir.join("simulate");
    let strategy_wal_dir = config.state_dir.join("strategy");

    let mut workers = Vec::new();
    for pair_config in &config.pairs {
        let mut starting_wallet = HashMap::new();
        starting_wallet.insert(
            pair_config.pair.to.clone(),
            STARTING_WALLET_QUOTE.parse::<Decimal>().unwrap(),
        );
        starting_wallet.insert(pair_config.pair.from.clone(), Decimal::ZERO);

        let trader = Arc::new(SimulateTrader::open(
            pair_config.pair.clone(),
            &trader_state_dir,
            starting_wallet,
            Decimal::ONE,
            clock.clone(),
        )?);
        trader.set_price(SEED_PRICE.parse::<Decimal>().unwrap());

        let strategy_config = StrategyConfig {
            pair: pair_config.pair.clone(),
            amount: pair_config.amount,
            max_dca_trades: pair_config.max_dca_trades,
            dca_percent_threshold_buy: pair_config.dca_percent_threshold_buy,
            dca_percent_threshold_sell: pair_config.dca_percent_threshold_sell,
        };

        let strategy = DcaStrategy::open(
            strategy_config,
            &strategy_wal_dir,
            config.segment_threshold,
            config.max_segments,
            trader.clone(),
            trader.clone(),
            clock.clone(),
        )?;

        state.register_pair(pair_config.pair.clone(), strategy.series(), strategy.journal());

        let poll_interval = Duration::from_secs(pair_config.poll_price_interval_secs);
        let worker = tokio::spawn(run_pair_worker(
            strategy,
            trader,
            poll_interval,
            state.clone(),
            balance_log.clone(),
            decision_log.clone(),
            shutdown.clone(),
        ));
        workers.push(worker);
    }

    let router = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "http surface listening");

    let server_shutdown = shutdown.clone();
    let serve = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    for worker in workers {
        let _ = worker.await;
    }
    let _ = serve.await;

    info!("dca engine stopped");
    Ok(())
}

/// One pair's lifecycle: initialise, then tick on a fixed interval until
/// cancelled, publishing a balance snapshot and decision record each tick.
async fn run_pair_worker(
    mut strategy: DcaStrategy,
    trader: Arc<SimulateTrader>,
    poll_interval: Duration,
    state: Arc<AppState>,
    balance_log: Arc<BalanceLog>,
    decision_log: Arc<DecisionLog>,
    ctx: CancellationToken,
) {
    let pair = strategy.pair().clone();

    if let Err(e) = strategy.initialize(&ctx).await {
        error!(pair = %pair.namespace(), error = %e, "initialization failed");
        state.record_error(&pair, e.to_string());
    } else {
        state.clear_error(&pair);
    }

    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticker.tick() => {}
        }

        walk_price(&trader, &pair);

        let outcome = match strategy.trade(&ctx).await {
            Ok(outcome) => {
                state.clear_error(&pair);
                outcome
            }
            Err(e) => {
                warn!(pair = %pair.namespace(), error = %e, "tick failed");
                state.record_error(&pair, e.to_string());
                continue;
            }
        };

        let price = trader.current_price().expect("walk_price sets it every tick");

        let (action, reason) = match &outcome {
            TickOutcome::Hold => (Action::Null, "within thresholds".to_string()),
            TickOutcome::NoData => (Action::Null, "series not yet seeded".to_string()),
            TickOutcome::Bought(_) => (Action::Buy, "dca threshold met".to_string()),
            TickOutcome::Sold(_) => (Action::Sell, "profit threshold met".to_string()),
        };

        let decision = Decision {
            timestamp: chrono::Utc::now(),
            pair: pair.clone(),
            action,
            reason,
            price,
        };
        if let Err(e) = decision_log.append(&decision) {
            warn!(pair = %pair.namespace(), error = %e, "failed to append decision");
        }
        state.bump_version();

        // A BalanceSnapshot only reflects the wallet/series after a mutation;
        // Hold/NoData ticks leave the series untouched, so no snapshot is due.
        if matches!(outcome, TickOutcome::Bought(_) | TickOutcome::Sold(_)) {
            let series = strategy.series().current();
            let base = series.total_amount;
            let quote = trader.wallet_balance(&pair.to);
            let total_quote = quote + base * price;
            let snapshot = BalanceSnapshot {
                timestamp: chrono::Utc::now(),
                pair: pair.clone(),
                base,
                quote,
                total_quote,
                price,
            };
            if let Err(e) = balance_log.append(&snapshot) {
                warn!(pair = %pair.namespace(), error = %e, "failed to append balance snapshot");
            }
            state.bump_version();
        }
    }

    if let Err(e) = strategy.close() {
        error!(pair = %pair.namespace(), error = %e, "failed to close strategy wal");
    }
}

/// Nudge the simulator's reference price by a small random percentage.
/// Stands in for a real market-data feed: no exchange adapter ships in
/// this core, so the simulator drives its own price for demo/dry-run use.
fn walk_price(trader: &SimulateTrader, pair: &crate::decimal::Pair) {
    use rand::Rng;

    let current = trader
        .current_price()
        .unwrap_or_else(|| SEED_PRICE.parse::<Decimal>().unwrap());
    let max_step_percent: Decimal = PRICE_WALK_PERCENT.parse().unwrap();

    // Random step in basis points of max_step_percent, signed.
    let step_bps: i64 = rand::thread_rng().gen_range(-10_000..=10_000);
    let step_percent = max_step_percent * Decimal::new(step_bps, 4);
    let factor = Decimal::ONE + step_percent / Decimal::ONE_HUNDRED;
    let next = (current * factor).max(Decimal::new(1, 2));

    trader.set_price(next);
    tracing::debug!(pair = %pair.namespace(), price = %next, "price walked");
}
