mod common;

use std::collections::HashMap;
use std::time::Duration;

use funding_keeper::api;
use funding_keeper::engine::{EngineCommand, PairState};
use funding_keeper::model::units::{FundingRate, Price, Usd};
use funding_keeper::portfolio::{PortfolioOptimizer, QualityTargets};
use funding_keeper::venues::paper::{OrderOutcome, PaperVenue};
use funding_keeper::venues::PerpVenue;

use common::{harness, make_plan, wait_for};

// ── Scenario S1: two venues, one spread, one plan ───────────────────

#[tokio::test]
async fn s1_scan_opens_one_balanced_pair_short_on_the_richer_venue() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    h.ctx.run_loop_once("scan_opportunities").await.unwrap();

    let snapshot = wait_for(&h.engine, "pair open", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Open)
    })
    .await;

    assert_eq!(snapshot.pairs.len(), 1, "exactly one plan expected");
    let pair = &snapshot.pairs[0];
    // Alpha funds richer (+0.0003) so it takes the short leg
    assert_eq!(pair.plan.opportunity.short_venue, "alpha");
    assert_eq!(pair.plan.opportunity.long_venue, "beta");
    assert!(
        pair.plan.notional.0 >= 1000.0 && pair.plan.notional.0 <= 50_000.0,
        "notional {} out of expected band",
        pair.plan.notional
    );
    // Equal base-asset sizes on both legs at construction
    assert!(
        (pair.plan.long_order.size.0 - pair.plan.short_order.size.0).abs() < 1e-12
    );
    // Profitability gate: net positive or bounded break-even with income
    let plan = &pair.plan;
    assert!(
        plan.expected_net_return_per_hour.0 > 0.0
            || (plan.break_even_hours <= 168.0 && plan.hourly_return.0 > 0.0)
    );
}

// ── Scenario S2: zero open interest kills the pair ──────────────────

#[tokio::test]
async fn s2_zero_open_interest_yields_no_opportunities() {
    let h = harness(0.0, 1_000_000.0).await;
    h.ctx.run_loop_once("scan_opportunities").await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.engine.snapshot().pairs.is_empty());
}

// ── Scenario S3: a spread dip is not a close trigger ────────────────

#[tokio::test]
async fn s3_spread_collapse_does_not_close_until_the_rolling_window() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    h.ctx.run_loop_once("scan_opportunities").await.unwrap();
    wait_for(&h.engine, "pair open", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Open)
    })
    .await;

    // Funding converges: next scan sees spread below the minimum
    h.venue_a
        .set_market("ETH", Price(3000.0), FundingRate::new(0.0002, 3), Usd(1_000_000.0));
    h.venue_b
        .set_market("ETH", Price(3000.0), FundingRate::new(0.0002, 3), Usd(1_000_000.0));

    h.ctx.run_loop_once("scan_opportunities").await.unwrap();
    h.ctx.run_loop_once("close_unprofitable").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Freshly opened: the rolling window has not elapsed, so no close
    let snapshot = h.engine.snapshot();
    assert!(
        snapshot.pairs.iter().any(|p| p.state == PairState::Open),
        "spread dip closed the pair prematurely"
    );
}

// ── Allocation bound (portfolio property) ───────────────────────────

#[tokio::test]
async fn allocations_never_exceed_capital_or_their_caps() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    let now = chrono::Utc::now().timestamp();

    let opp = make_plan("beta", "alpha", 1.0, 0).opportunity;
    let mut second = opp.clone();
    second.spread = 0.00025;
    second.short_rate = FundingRate::new(0.00035, 3);
    second.expected_return_apr = FundingRate::new(0.00025, 3).annualized();
    let opportunities = vec![opp, second];

    let optimizer = PortfolioOptimizer {
        leverage: 2.0,
        ..Default::default()
    };
    let fee_rates = HashMap::from([("alpha".to_string(), 0.0001), ("beta".to_string(), 0.0001)]);
    let capital = Usd(30_000.0);
    let outcome = optimizer.allocate(
        &opportunities,
        capital,
        &h.history,
        &fee_rates,
        &QualityTargets::default(),
        now,
    );

    let total: f64 = outcome.allocations.iter().map(|a| a.amount.0).sum();
    assert!(total <= capital.0 + 1e-6, "allocated {total} over capital");
    for allocation in &outcome.allocations {
        assert!(
            allocation.amount.0 <= allocation.cap.0 + 1e-6,
            "allocation exceeds its cap"
        );
        let max = optimizer
            .max_portfolio_for_target_apy(&allocation.opportunity, &fee_rates)
            .expect("allocated opportunity must have a viable size");
        assert!(allocation.cap.0 <= max.0 + 1e-6);
    }
}

// ── Funding sign convention ─────────────────────────────────────────

#[tokio::test]
async fn positive_funding_pays_the_short_and_charges_the_long() {
    let venue = PaperVenue::new("gamma", 7);
    venue.set_balance(Usd(10_000.0));
    venue.set_market("ETH", Price(3000.0), FundingRate::new(0.0003, 3), Usd(1_000_000.0));

    // Build a short 1 ETH via a scripted fill
    venue.push_order_outcome(OrderOutcome::Fill);
    let plan = make_plan("x", "gamma", 1.0, 0);
    venue.place_order(&funding_keeper::venues::OrderRequest {
        symbol: "ETH".into(),
        side: plan.short_order.side,
        order_type: funding_keeper::model::OrderType::Limit,
        size: plan.short_order.size,
        price: plan.short_order.limit_price,
        tif: funding_keeper::model::Tif::Gtc,
        reduce_only: false,
        client_order_id: "short-leg".into(),
    })
    .await
    .unwrap();

    let before = venue.balance().await.unwrap();
    venue.advance(Duration::from_secs(8 * 3600));
    let after = venue.balance().await.unwrap();
    assert!(
        after.0 > before.0,
        "short should collect positive funding, {before} -> {after}"
    );
    let payments = venue.funding_payments(0, i64::MAX).await.unwrap();
    assert!(payments.iter().all(|p| p.amount.0 > 0.0));
}

// ── Scenario S6: diagnostics shape with an in-flight plan ───────────

#[tokio::test]
async fn s6_diagnostics_excludes_in_flight_plans_from_positions() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    // Both legs rest so the pair stays in submitting
    h.venue_a.push_order_outcome(OrderOutcome::Rest);
    h.venue_b.push_order_outcome(OrderOutcome::Rest);
    let plan = make_plan("beta", "alpha", 1.0, 0);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;

    wait_for(&h.engine, "pair submitting", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Submitting)
    })
    .await;

    let diagnostics = api::build_diagnostics(&h.ctx);
    assert!(diagnostics.health.overall == "OK" || diagnostics.health.overall == "DEGRADED");
    assert_eq!(
        diagnostics.positions.count, 0,
        "in-flight plan must not count as a position"
    );
    // recent errors is always an array, possibly empty
    assert!(diagnostics.errors.recent.is_empty());
    assert!(diagnostics.uptime.hours >= 0.0);
}
