mod common;

use std::collections::HashMap;
use std::time::Duration;

use funding_keeper::engine::{EngineCommand, PairState};
use funding_keeper::model::plan::{OrderType, Side, Tif};
use funding_keeper::model::units::BaseQty;
use funding_keeper::venues::paper::OrderOutcome;
use funding_keeper::venues::{OrderRequest, PerpVenue, VenueError};

use common::{harness, make_plan, wait_for};

// ── Entry ───────────────────────────────────────────────────────────

#[tokio::test]
async fn both_legs_fill_and_the_pair_opens_delta_neutral() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    let plan = make_plan("beta", "alpha", 1.0, 0);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;

    let snapshot = wait_for(&h.engine, "pair open", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Open)
    })
    .await;

    let positions = snapshot.live_positions();
    assert_eq!(positions.len(), 2);
    let long = positions.iter().find(|p| p.venue == "beta").unwrap();
    let short = positions.iter().find(|p| p.venue == "alpha").unwrap();
    let avg = (long.size.0 + short.size.0) / 2.0;
    let drift = (long.size.0 - short.size.0).abs() / avg;
    assert!(drift <= 0.02, "post-fill drift {drift} breaches the limit");
    assert_eq!(h.venue_b.position_qty("ETH").0, 1.0);
    assert_eq!(h.venue_a.position_qty("ETH").0, -1.0);
}

#[tokio::test]
async fn stale_scan_plans_are_rejected() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    h.engine.send(EngineCommand::NoteScan { scan_id: 5 }).await;
    let plan = make_plan("beta", "alpha", 1.0, 3);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.engine.snapshot().pairs.is_empty());
}

// ── Single-leg handling (S5) ────────────────────────────────────────

#[tokio::test]
async fn rate_limited_short_retries_once_then_flattens_the_long() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    // Short leg lands on alpha: first attempt rate limited, retry dies too
    h.venue_a.push_order_outcome(OrderOutcome::Fail(VenueError::RateLimited {
        retry_after: Duration::from_millis(10),
    }));
    h.venue_a
        .push_order_outcome(OrderOutcome::Fail(VenueError::Network("still down".into())));

    let plan = make_plan("beta", "alpha", 1.0, 0);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;

    let snapshot = wait_for(&h.engine, "incident resolved", |s| {
        s.incidents.iter().any(|i| i.resolved)
    })
    .await;

    let pair = &snapshot.pairs[0];
    assert_eq!(pair.state, PairState::Failed);
    let incident = snapshot.incidents.iter().find(|i| i.resolved).unwrap();
    assert_eq!(incident.venue, "beta");
    assert_eq!(incident.reduce_side, Side::Sell);
    // The filled long was flattened back out
    assert!(h.venue_b.position_qty("ETH").0.abs() < 1e-9);
    assert!(h.venue_a.position_qty("ETH").0.abs() < 1e-9);
}

#[tokio::test]
async fn resting_partial_leg_times_out_and_flattens() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    // Short leg rests unfilled forever
    h.venue_a.push_order_outcome(OrderOutcome::Rest);

    let plan = make_plan("beta", "alpha", 1.0, 0);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;

    // Timer (50ms) must fire, cancel the resting short, flatten the long
    let snapshot = wait_for(&h.engine, "incident resolved", |s| {
        s.incidents.iter().any(|i| i.resolved)
    })
    .await;
    assert_eq!(snapshot.pairs[0].state, PairState::Failed);
    assert!(h.venue_b.position_qty("ETH").0.abs() < 1e-9);
    let open_orders = h.venue_a.open_orders(Some("ETH")).await.unwrap();
    assert!(open_orders.is_empty(), "hanging short was not cancelled");
}

// ── Close ───────────────────────────────────────────────────────────

#[tokio::test]
async fn close_pair_flattens_both_venues() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    let plan = make_plan("beta", "alpha", 2.0, 0);
    let pair_id = plan.id;
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;
    wait_for(&h.engine, "pair open", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Open)
    })
    .await;

    h.engine
        .send(EngineCommand::ClosePair {
            pair_id,
            reason: "test close".into(),
        })
        .await;
    wait_for(&h.engine, "pair closed", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Closed)
    })
    .await;

    assert!(h.venue_a.position_qty("ETH").0.abs() < 1e-9);
    assert!(h.venue_b.position_qty("ETH").0.abs() < 1e-9);
}

// ── Reconciliation ──────────────────────────────────────────────────

async fn venue_truth(h: &common::Harness) -> HashMap<String, Vec<funding_keeper::venues::VenuePosition>> {
    let mut map = HashMap::new();
    map.insert("alpha".to_string(), h.venue_a.positions().await.unwrap());
    map.insert("beta".to_string(), h.venue_b.positions().await.unwrap());
    map
}

#[tokio::test]
async fn reconcile_is_idempotent_without_venue_changes() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    let plan = make_plan("beta", "alpha", 1.0, 0);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;
    wait_for(&h.engine, "pair open", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Open)
    })
    .await;

    let truth = venue_truth(&h).await;
    h.engine
        .send(EngineCommand::Reconcile {
            venue_positions: truth.clone(),
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events_after_first = h.store.event_count();
    let sizes_after_first: Vec<f64> = h
        .engine
        .snapshot()
        .live_positions()
        .iter()
        .map(|p| p.size.0)
        .collect();

    h.engine
        .send(EngineCommand::Reconcile {
            venue_positions: truth,
        })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Second pass with identical venue state mutates nothing
    assert_eq!(h.store.event_count(), events_after_first);
    let sizes_after_second: Vec<f64> = h
        .engine
        .snapshot()
        .live_positions()
        .iter()
        .map(|p| p.size.0)
        .collect();
    assert_eq!(sizes_after_first, sizes_after_second);
}

#[tokio::test]
async fn ghost_leg_is_dropped_and_survivor_handed_to_incident_loop() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    let plan = make_plan("beta", "alpha", 1.0, 0);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;
    wait_for(&h.engine, "pair open", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Open)
    })
    .await;

    // The short on alpha evaporates out-of-band (venue-side liquidation)
    h.venue_a
        .place_order(&OrderRequest {
            symbol: "ETH".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            size: BaseQty(1.0),
            price: None,
            tif: Tif::Ioc,
            reduce_only: true,
            client_order_id: "out-of-band".into(),
        })
        .await
        .unwrap();

    let truth = venue_truth(&h).await;
    h.engine
        .send(EngineCommand::Reconcile {
            venue_positions: truth,
        })
        .await;

    let snapshot = wait_for(&h.engine, "ghost handled", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Failed)
    })
    .await;
    // The surviving long leg became an incident to flatten
    assert!(snapshot
        .incidents
        .iter()
        .any(|i| i.venue == "beta" && i.reduce_side == Side::Sell));
}

// ── Drift enforcement ───────────────────────────────────────────────

#[tokio::test]
async fn drifted_pair_is_rebalanced_back_to_equal_legs() {
    let h = harness(1_000_000.0, 1_000_000.0).await;
    let plan = make_plan("beta", "alpha", 1.0, 0);
    h.engine.send(EngineCommand::Submit(Box::new(plan))).await;
    wait_for(&h.engine, "pair open", |s| {
        s.pairs.iter().any(|p| p.state == PairState::Open)
    })
    .await;

    // Out-of-band fill bloats the long to 1.1
    h.venue_b
        .place_order(&OrderRequest {
            symbol: "ETH".into(),
            side: Side::Buy,
            order_type: OrderType::Market,
            size: BaseQty(0.1),
            price: None,
            tif: Tif::Ioc,
            reduce_only: false,
            client_order_id: "drift-in".into(),
        })
        .await
        .unwrap();

    let truth = venue_truth(&h).await;
    h.engine
        .send(EngineCommand::Reconcile {
            venue_positions: truth,
        })
        .await;
    h.engine.send(EngineCommand::CheckDrift).await;

    wait_for(&h.engine, "legs equal again", |s| {
        let positions = s.live_positions();
        positions.len() == 2
            && (positions[0].size.0 - positions[1].size.0).abs() < 1e-9
    })
    .await;
    assert!((h.venue_b.position_qty("ETH").0 - 1.0).abs() < 1e-9);
}
