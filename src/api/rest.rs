// =============================================================================
// HTTP Ingress — Axum 0.7
// =============================================================================
//
// The scheduler is normally driven by the internal cron task; this ingress
// exists for the platform's trigger path and for operators:
//
//   GET  /api/v1/health            — liveness
//   POST /api/v1/tick?cryptoOnly=1 — run one tick (reduced crypto path)
//   POST /api/v1/allocation/run    — run the daily allocation pass
//   GET  /api/v1/state             — full snapshot for the platform UI
//   POST /api/v1/admin/force-close — close one position at market
//
// Contract: 200 with a JSON body on success, 500 with `{"error": ...}` on
// internal failure. Authentication happens at the edge in front of this
// service.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::app_state::AppState;
use crate::manager::{ExitEvent, ManageOutcome};
use crate::position::PositionStatus;
use crate::store::LaneStore;
use crate::types::{EngineContext, ExitReason};

/// Build the full router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/tick", post(run_tick))
        .route("/api/v1/allocation/run", post(run_allocation))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/admin/force-close", post(force_close))
        .layer(cors)
        .with_state(state)
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %e, "ingress request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{e}") })),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Tick trigger
// =============================================================================

#[derive(Deserialize)]
struct TickParams {
    /// `cryptoOnly=1` selects the reduced path: equity engines are skipped.
    #[serde(default, rename = "cryptoOnly")]
    crypto_only: Option<String>,
}

async fn run_tick(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TickParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let crypto_only = params.crypto_only.as_deref() == Some("1");
    match state.run_tick(crypto_only).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => Err(internal_error(e)),
    }
}

// =============================================================================
// Allocation trigger
// =============================================================================

async fn run_allocation(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    if !state.config.read().enable_allocation {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "allocation pass is disabled" })),
        ));
    }
    let report = state.run_allocation();
    Ok(Json(serde_json::json!({
        "score_rows": report.score_rows,
        "promotions": report.promotions,
        "proposals": report.proposals,
    })))
}

// =============================================================================
// State snapshot
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Admin force-close
// =============================================================================

#[derive(Deserialize)]
struct ForceCloseRequest {
    position_id: String,
}

async fn force_close(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForceCloseRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    // Locate the position in either partition.
    let Some(position) = state
        .store
        .all_open_positions()
        .into_iter()
        .find(|p| p.id == req.position_id && p.status == PositionStatus::Open)
    else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("position {} not found", req.position_id) })),
        ));
    };

    // Close at the freshest price available.
    let price = match state
        .market
        .fetch_position_bars(&position.symbol)
        .await
    {
        Ok(data) if data.current_price > 0.0 => data.current_price,
        Ok(_) | Err(_) => {
            warn!(symbol = %position.symbol, "no market price — closing at entry");
            position.entry_price
        }
    };

    let lane = LaneStore::for_context(
        state.store.clone(),
        EngineContext {
            engine_key: position.engine_key.clone(),
            engine_version: position.engine_version.clone(),
            run_mode: position.run_mode,
            style: crate::types::TradingStyle::Swing,
            now: chrono::Utc::now(),
        },
    );
    let outcome = ManageOutcome {
        exits: vec![ExitEvent {
            reason: ExitReason::ForceClosedAdmin,
            price,
            qty: position.qty,
        }],
        position: None,
    };
    let stamp = state.config.read().enable_signal_outcomes;
    if let Err(e) = crate::manager::apply_outcome(&lane, &position, outcome, stamp) {
        return Err(internal_error(e));
    }
    state.increment_version();
    info!(
        position_id = %req.position_id,
        symbol = %position.symbol,
        price,
        "position force-closed by admin"
    );

    Ok(Json(serde_json::json!({
        "closed": req.position_id,
        "price": price,
    })))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::market::sim::ScriptedMarketData;
    use crate::position::{OpenSpec, Position};
    use crate::store::MemoryStore;
    use crate::types::{RunMode, Side, TradingStyle};

    fn app_state(sim: ScriptedMarketData) -> Arc<AppState> {
        Arc::new(AppState::new(
            EngineConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(sim),
        ))
    }

    #[tokio::test]
    async fn force_close_writes_trade_and_removes_position() {
        let sim = ScriptedMarketData::new();
        sim.set_quote("NVDA", 101.5);
        let state = app_state(sim);

        let pos = Position::open(OpenSpec {
            engine_key: "swing".into(),
            engine_version: "v3".into(),
            run_mode: RunMode::Primary,
            symbol: "NVDA".into(),
            side: Side::Long,
            entry_price: 100.0,
            qty: 10.0,
            stop_loss: 98.0,
            take_profit_1: 104.0,
            take_profit_2: None,
            signal_id: None,
            opened_at: chrono::Utc::now(),
        });
        let lane = LaneStore::for_context(
            state.store.clone(),
            EngineContext {
                engine_key: "swing".into(),
                engine_version: "v3".into(),
                run_mode: RunMode::Primary,
                style: TradingStyle::Swing,
                now: chrono::Utc::now(),
            },
        );
        lane.insert_position(&pos).unwrap();

        let result = force_close(
            State(state.clone()),
            Json(ForceCloseRequest {
                position_id: pos.id.clone(),
            }),
        )
        .await;
        assert!(result.is_ok());

        assert!(lane.open_positions().is_empty());
        let trades = lane.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_reason, ExitReason::ForceClosedAdmin);
        assert!((trades[0].exit_price - 101.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn force_close_unknown_position_is_an_error() {
        let state = app_state(ScriptedMarketData::new());
        let result = force_close(
            State(state),
            Json(ForceCloseRequest {
                position_id: "nope".into(),
            }),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn tick_endpoint_reports() {
        let state = app_state(ScriptedMarketData::new());
        let result = run_tick(
            State(state),
            Query(TickParams {
                crypto_only: Some("1".into()),
            }),
        )
        .await;
        assert!(result.is_ok());
    }
}
