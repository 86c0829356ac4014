mod common;

use std::collections::HashMap;
use std::sync::Arc;

use funding_keeper::liquidity::LiquidityOptimizer;
use funding_keeper::model::units::{FundingRate, Price, Usd};
use funding_keeper::planner::{ExecutionPlanBuilder, FeeSchedule, PlanError, PlannerConfig};
use funding_keeper::venues::paper::PaperVenue;
use funding_keeper::venues::PerpVenue;

use common::make_plan;

fn planner(maker: f64, taker: f64) -> ExecutionPlanBuilder {
    let fees = HashMap::from([
        ("alpha".to_string(), FeeSchedule { maker, taker }),
        ("beta".to_string(), FeeSchedule { maker, taker }),
    ]);
    ExecutionPlanBuilder::new(
        PlannerConfig {
            leverage: 2.0,
            balance_usage_pct: 0.9,
            min_position_usd: Usd(1000.0),
            max_break_even_hours: 168.0,
            fees,
        },
        LiquidityOptimizer::default(),
    )
}

fn venues(balance: f64, oi: f64) -> HashMap<String, Arc<dyn PerpVenue>> {
    let mut map: HashMap<String, Arc<dyn PerpVenue>> = HashMap::new();
    for (id, seed) in [("alpha", 1u64), ("beta", 2u64)] {
        let venue = Arc::new(PaperVenue::new(id, seed));
        venue.set_balance(Usd(balance));
        venue.set_market("ETH", Price(3000.0), FundingRate::new(0.0002, 3), Usd(oi));
        map.insert(id.to_string(), venue);
    }
    map
}

#[tokio::test]
async fn accepted_plan_has_equal_legs_posted_at_mark() {
    let planner = planner(0.0001, 0.0003);
    let venues = venues(25_000.0, 1_000_000.0);
    let opp = make_plan("beta", "alpha", 1.0, 0).opportunity;

    let plan = planner
        .build(&opp, Usd(50_000.0), &venues, 1000)
        .await
        .expect("plan should be accepted");

    assert_eq!(plan.long_order.size.0, plan.short_order.size.0);
    assert_eq!(plan.long_order.limit_price, Some(opp.long_mark));
    assert_eq!(plan.short_order.limit_price, Some(opp.short_mark));
    assert_eq!(plan.long_order.client_order_id, format!("{}-L", plan.id));
    assert_eq!(plan.short_order.client_order_id, format!("{}-S", plan.id));
    assert!(plan.validate().is_ok());
    // Capital bound: min balance × usage × leverage
    assert!(plan.notional.0 <= 25_000.0 * 0.9 * 2.0 + 1e-6);
}

#[tokio::test]
async fn thin_balances_fail_with_insufficient_balance() {
    let planner = planner(0.0001, 0.0003);
    let venues = venues(500.0, 1_000_000.0);
    let opp = make_plan("beta", "alpha", 1.0, 0).opportunity;

    let err = planner
        .build(&opp, Usd(50_000.0), &venues, 1000)
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::InsufficientBalance { .. }), "got {err}");
}

#[tokio::test]
async fn thin_market_fails_with_liquidity_too_low() {
    let planner = planner(0.0001, 0.0003);
    let venues = venues(25_000.0, 3000.0);
    let mut opp = make_plan("beta", "alpha", 1.0, 0).opportunity;
    opp.long_oi = Usd(3000.0);
    opp.short_oi = Usd(3000.0);

    let err = planner
        .build(&opp, Usd(50_000.0), &venues, 1000)
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::LiquidityTooLow { .. }), "got {err}");
}

#[tokio::test]
async fn heavy_exit_fees_fail_the_profitability_gate() {
    // Maker entry is cheap enough to pass the liquidity floor, but taker
    // exits push break-even past the 7-day bound
    let planner = planner(0.0002, 0.0045);
    let venues = venues(25_000.0, 1_000_000.0);
    let opp = make_plan("beta", "alpha", 1.0, 0).opportunity;

    let err = planner
        .build(&opp, Usd(50_000.0), &venues, 1000)
        .await
        .unwrap_err();
    match err {
        PlanError::Unprofitable {
            net_return,
            break_even_hours,
        } => {
            assert!(net_return.0 <= 0.0 || break_even_hours > 168.0);
        }
        other => panic!("expected Unprofitable, got {other}"),
    }
}

#[tokio::test]
async fn unknown_venue_fails_fast() {
    let planner = planner(0.0001, 0.0003);
    let venues = venues(25_000.0, 1_000_000.0);
    let mut opp = make_plan("beta", "alpha", 1.0, 0).opportunity;
    opp.short_venue = "nowhere".into();

    let err = planner
        .build(&opp, Usd(50_000.0), &venues, 1000)
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::VenueUnavailable(_)), "got {err}");
}
