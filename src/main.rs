use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use schemars::schema_for;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use funding_keeper::aggregator::{FundingAggregator, SymbolAliases};
use funding_keeper::cli::{Cli, Command};
use funding_keeper::config::{KeeperConfig, StorageKind, VenueKind};
use funding_keeper::engine::{EngineConfig, ExecutionEngine};
use funding_keeper::history::{HistoricalStore, HistoryConfig};
use funding_keeper::keeper::{metrics, rate_limit::RateBudgets, KeeperCtx, KeeperScheduler};
use funding_keeper::liquidity::LiquidityOptimizer;
use funding_keeper::model::units::{FundingRate, Pct, Price, Usd};
use funding_keeper::model::VenueId;
use funding_keeper::neutral::DeltaNeutralController;
use funding_keeper::planner::{ExecutionPlanBuilder, FeeSchedule, PlannerConfig};
use funding_keeper::portfolio::{PortfolioOptimizer, QualityTargets};
use funding_keeper::store::{file::FileStore, memory::MemoryStore, sqlite::SqliteStore, Store};
use funding_keeper::venues::paper::{PaperLending, PaperVenue};
use funding_keeper::venues::{LendingVenue, PerpVenue};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            dry_run,
            once,
            seed,
        } => run(&config, dry_run, once, seed),
        Command::CheckConfig { config } => check_config(&config),
        Command::Schema => {
            let schema = schema_for!(KeeperConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Command::Example => {
            let example = KeeperConfig::example();
            println!("{}", toml::to_string_pretty(&example)?);
            Ok(())
        }
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = KeeperConfig::load(path)?;
    println!("config ok: {} venues, {} symbols", config.venues.len(), config.effective_symbols().len());
    for (id, venue) in &config.venues {
        let creds = match &venue.credentials {
            Some(source) => match source.resolve() {
                Ok(_) => "resolved",
                Err(_) => "MISSING",
            },
            None => "none",
        };
        println!(
            "  {id}: kind={:?} weight={}/min fees={}/{} credentials={creds}",
            venue.kind, venue.weight_per_minute, venue.fee_rates.maker, venue.fee_rates.taker,
        );
    }
    if let Some(lev) = &config.leveraged {
        println!(
            "  leveraged: {} short on {} vs {} borrow, HF ladder {}/{}/{}/{}",
            lev.asset, lev.venue, lev.lending_venue,
            lev.emergency_hf, lev.warn_hf, lev.min_hf, lev.target_hf,
        );
    }
    Ok(())
}

fn run(config_path: &Path, dry_run: bool, once: bool, seed: u64) -> Result<()> {
    let config = KeeperConfig::load(config_path)?;
    if !dry_run {
        bail!(
            "no live venue adapters are linked into this binary; run with \
             --dry-run for paper venues, or embed the keeper as a library \
             and register your adapters"
        );
    }

    println!("=== funding-keeper run ===");
    println!("Config:   {}", config_path.display());
    println!("Venues:   {}", config.venues.len());
    println!("Symbols:  {:?}", config.effective_symbols());
    println!("Dry run:  {dry_run}");
    println!("Once:     {once}");
    println!();

    let rt = tokio::runtime::Runtime::new().context("creating tokio runtime")?;
    rt.block_on(run_async(config, once, seed))
}

async fn run_async(config: KeeperConfig, once: bool, seed: u64) -> Result<()> {
    let symbols = config.effective_symbols();

    // Paper venues with synthetic markets so a dry run has spreads to find
    let mut perps: HashMap<VenueId, Arc<dyn PerpVenue>> = HashMap::new();
    let mut spots: HashMap<VenueId, Arc<dyn PerpVenue>> = HashMap::new();
    let mut lendings: HashMap<VenueId, Arc<dyn LendingVenue>> = HashMap::new();
    for (i, (id, venue_config)) in config.venues.iter().enumerate() {
        match venue_config.kind {
            VenueKind::Perp | VenueKind::Spot => {
                let paper = PaperVenue::new(id, seed + i as u64);
                paper.set_balance(Usd(100_000.0));
                for (j, symbol) in symbols.iter().enumerate() {
                    let mark = Price(1000.0 * (j + 1) as f64);
                    let rate = FundingRate::new(
                        0.0001 + 0.00015 * i as f64,
                        venue_config.intervals_per_day,
                    );
                    paper.set_market(symbol, mark, rate, Usd(5_000_000.0));
                }
                let paper: Arc<dyn PerpVenue> = Arc::new(paper);
                if venue_config.kind == VenueKind::Spot {
                    spots.insert(id.clone(), paper);
                } else {
                    perps.insert(id.clone(), paper);
                }
                info!(venue = %id, "paper venue seeded with synthetic markets");
            }
            VenueKind::Lending => {
                let paper = PaperLending::new(id, 0.8);
                paper.set_rates(2.0, 4.5);
                lendings.insert(id.clone(), Arc::new(paper));
                info!(venue = %id, "paper lending market seeded");
            }
        }
    }

    // Persistence; crash-safe restart reconciles before any new plan
    let store: Arc<dyn Store> = match config.storage.kind {
        StorageKind::Memory => Arc::new(MemoryStore::new()),
        StorageKind::File => {
            let dir = config
                .storage
                .path
                .clone()
                .unwrap_or_else(|| "keeper-state".into());
            Arc::new(FileStore::open(&dir)?)
        }
        StorageKind::Sql => {
            let path = config
                .storage
                .path
                .clone()
                .unwrap_or_else(|| "keeper.db".into());
            Arc::new(SqliteStore::open(&path)?)
        }
    };
    let restored = store.load_snapshot()?.unwrap_or_default();
    if !restored.positions.is_empty() {
        info!(
            positions = restored.positions.len(),
            incidents = restored.incidents.len(),
            "restored persisted state; reconciling before new plans"
        );
    }

    let now = chrono::Utc::now().timestamp();
    let shared_metrics = metrics::shared(now);
    {
        let mut m = shared_metrics.lock().unwrap();
        m.realized_funding = restored.realized_funding;
        m.realized_pnl = restored.realized_pnl;
    }

    let history = Arc::new(HistoricalStore::new(HistoryConfig {
        retention_secs: config.history.retention_days as i64 * 24 * 3600,
        half_life_hours: config.history.half_life_hours,
        min_samples: config.history.min_samples,
        ..Default::default()
    }));

    let mut aliases = SymbolAliases::default();
    for (venue_id, venue_config) in &config.venues {
        for (canonical, native) in &venue_config.aliases {
            aliases.insert(venue_id, native, canonical);
        }
    }
    let aggregator = FundingAggregator::new(config.min_spread, aliases);

    let portfolio = PortfolioOptimizer {
        target_apy: Pct::from_decimal(config.target_apy),
        leverage: config.leverage,
        horizon_hours: config.liquidity.horizon_hours,
        ..Default::default()
    };
    let quality = QualityTargets {
        per_venue: config
            .venues
            .iter()
            .map(|(id, v)| (id.clone(), v.target_samples))
            .collect(),
        default: 168,
    };

    let planner = ExecutionPlanBuilder::new(
        PlannerConfig {
            leverage: config.leverage,
            balance_usage_pct: config.balance_usage_pct,
            min_position_usd: Usd(config.min_position_usd),
            max_break_even_hours: config.max_break_even_days * 24.0,
            fees: config
                .venues
                .iter()
                .map(|(id, v)| {
                    (
                        id.clone(),
                        FeeSchedule {
                            maker: v.fee_rates.maker,
                            taker: v.fee_rates.taker,
                        },
                    )
                })
                .collect(),
        },
        LiquidityOptimizer {
            apy_floor: Pct::from_decimal(config.liquidity.apy_floor),
            horizon_hours: config.liquidity.horizon_hours,
            min_size: Usd(config.min_position_usd),
        },
    );

    let mut trade_venues = perps.clone();
    trade_venues.extend(spots.clone());
    let engine = ExecutionEngine::spawn(
        trade_venues,
        store.clone(),
        shared_metrics.clone(),
        EngineConfig {
            drift_limit: config.drift_limit,
            partial_timeout: std::time::Duration::from_secs(config.partial_timeout_secs),
            close_strays: config.reconcile.close_strays,
        },
        restored.positions,
        restored.incidents,
    );

    let limits: HashMap<VenueId, u32> = config
        .venues
        .iter()
        .map(|(id, v)| (id.clone(), v.weight_per_minute))
        .collect();
    let budgets = RateBudgets::new(&limits);

    let neutral = match &config.leveraged {
        Some(lev) => {
            let perp = perps
                .get(&lev.venue)
                .cloned()
                .with_context(|| format!("leveraged venue '{}' not built", lev.venue))?;
            let lending = lendings
                .get(&lev.lending_venue)
                .cloned()
                .with_context(|| format!("lending venue '{}' not built", lev.lending_venue))?;
            Some(DeltaNeutralController::new(lev.clone(), perp, lending))
        }
        None => None,
    };

    let ctx = Arc::new(KeeperCtx::new(
        config.clone(),
        perps,
        spots,
        lendings,
        aggregator,
        history,
        portfolio,
        quality,
        planner,
        engine,
        budgets,
        shared_metrics,
        store,
        neutral,
    ));

    // Venue truth first: reconcile restored state before planning anything
    ctx.run_loop_once("verify_position_state").await?;

    if once {
        ctx.run_all_once().await?;
        ctx.persist_snapshot();
        println!("single pass complete; state saved");
        return Ok(());
    }

    if config.api.enabled {
        let api_ctx = ctx.clone();
        let host = config.api.host.clone();
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = funding_keeper::api::serve(&host, port, api_ctx).await {
                warn!(error = %format!("{e:#}"), "diagnostics server exited");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    KeeperScheduler::new(ctx).run(shutdown_rx).await
}
