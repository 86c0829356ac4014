//! Diagnostics HTTP surface: a pull-only view of keeper state plus a
//! metrics reset. No auth, no push — operators front it themselves.

pub mod error;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::keeper::KeeperCtx;
use crate::model::position::PositionSide;
use crate::store::StoredEvent;

use error::ApiError;
use types::*;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<KeeperCtx>,
}

pub fn router(ctx: Arc<KeeperCtx>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/diagnostics", get(diagnostics))
        .route("/reset-metrics", post(reset_metrics))
        .layer(cors)
        .with_state(AppState { ctx })
}

pub async fn serve(host: &str, port: u16, ctx: Arc<KeeperCtx>) -> Result<()> {
    let addr = format!("{host}:{port}");
    let app = router(ctx);
    println!("diagnostics listening on {addr}");
    println!("  GET  http://{addr}/diagnostics");
    println!("  POST http://{addr}/reset-metrics");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    axum::serve(listener, app).await.context("serving diagnostics")?;
    Ok(())
}

async fn diagnostics(
    State(state): State<AppState>,
) -> Result<Json<DiagnosticsResponse>, ApiError> {
    Ok(Json(build_diagnostics(&state.ctx)))
}

/// Assemble the diagnostics view from engine snapshot, metrics and the
/// historical store's latest marks.
pub fn build_diagnostics(ctx: &Arc<KeeperCtx>) -> DiagnosticsResponse {
    let now = chrono::Utc::now().timestamp();
    let snapshot = ctx.engine.snapshot();

    // Position book with marks from the historical store
    let mut active = Vec::new();
    let mut total_value = 0.0;
    let mut unrealized = 0.0;
    let mut by_exchange: HashMap<String, f64> = HashMap::new();
    for position in snapshot.live_positions() {
        let mark = ctx
            .history
            .latest_mark(&position.venue, &position.symbol)
            .unwrap_or(position.entry_price);
        let notional = position.size.0 * mark.0;
        let pnl = match position.side {
            PositionSide::Long => (mark.0 - position.entry_price.0) * position.size.0,
            PositionSide::Short => (position.entry_price.0 - mark.0) * position.size.0,
        };
        total_value += notional;
        unrealized += pnl;
        *by_exchange.entry(position.venue.clone()).or_default() += notional;
        active.push(ActivePosition {
            id: position.id.to_string(),
            venue: position.venue.clone(),
            symbol: position.symbol.clone(),
            side: position.side.to_string(),
            size: position.size.0,
            entry_price: position.entry_price.0,
            notional,
            status: format!("{:?}", position.status).to_lowercase(),
            opened_at: position.opened_at,
        });
    }

    // Health ladder: drained beats incidents beats clean
    let unresolved: Vec<String> = snapshot
        .incidents
        .iter()
        .filter(|i| !i.resolved)
        .map(|i| format!("unresolved single-leg incident on {} ({})", i.venue, i.symbol))
        .collect();
    let (overall, issues) = if ctx.is_drained() {
        (
            "FAILED".to_string(),
            vec!["keeper drained after fatal error".to_string()],
        )
    } else if !unresolved.is_empty() {
        ("DEGRADED".to_string(), unresolved)
    } else {
        ("OK".to_string(), Vec::new())
    };

    let metrics = ctx.metrics.lock().unwrap();
    let estimated = metrics
        .rolling_apy(24 * 3600, now)
        .unwrap_or_else(|| {
            let mut weighted = 0.0;
            let mut notional = 0.0;
            for pair in snapshot.open_pairs() {
                weighted += pair.plan.opportunity.expected_return_apr.0 * pair.plan.notional.0;
                notional += pair.plan.notional.0;
            }
            if notional > 0.0 {
                weighted / notional
            } else {
                0.0
            }
        });
    let deployed = crate::model::Usd(total_value.max(1.0));

    DiagnosticsResponse {
        apy: ApySection {
            realized: metrics.realized_apy(deployed, now),
            estimated,
            net_funding: metrics.realized_funding,
            by_exchange: metrics.funding_by_exchange.clone(),
        },
        positions: PositionsSection {
            count: active.len(),
            total_value,
            unrealized_pnl: unrealized,
            by_exchange,
            active,
        },
        health: HealthSection { overall, issues },
        errors: ErrorsSection {
            recent: metrics.recent_errors(),
        },
        uptime: UptimeSection {
            hours: metrics.uptime_hours(now),
        },
    }
}

async fn reset_metrics(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let now = chrono::Utc::now().timestamp();
    state.ctx.metrics.lock().unwrap().reset_realized();
    state
        .ctx
        .store
        .append(&StoredEvent::MetricsReset { timestamp: now })
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    info!("realized metrics reset");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
