mod common;

use std::sync::Arc;

use funding_keeper::config::LeveragedConfig;
use funding_keeper::model::plan::{OrderType, Side, Tif};
use funding_keeper::model::units::{BaseQty, FundingRate, Price, Usd};
use funding_keeper::neutral::{ControllerAction, DeltaNeutralController};
use funding_keeper::venues::paper::{PaperLending, PaperVenue};
use funding_keeper::venues::{LendingVenue, OrderRequest, PerpVenue};

fn leveraged_config() -> LeveragedConfig {
    LeveragedConfig {
        venue: "perp".into(),
        lending_venue: "lend".into(),
        asset: "ETH".into(),
        min_hf: 1.5,
        target_hf: 2.0,
        emergency_hf: 1.3,
        warn_hf: 1.4,
        max_leverage: 3.0,
        funding_flip_threshold: 0.0,
        min_funding_rate: 0.0001,
        min_carry_apy: 0.05,
        liquidation_threshold: 0.8,
        drift_limit: 0.02,
        rebalance_cooldown_secs: 3600,
        max_position_usd: 100_000.0,
    }
}

fn venues(rate: f64) -> (Arc<PaperVenue>, Arc<PaperLending>) {
    let perp = Arc::new(PaperVenue::new("perp", 9));
    perp.set_balance(Usd(10_000.0));
    perp.set_market("ETH", Price(3000.0), FundingRate::new(rate, 3), Usd(5_000_000.0));
    let lend = Arc::new(PaperLending::new("lend", 0.8));
    lend.set_rates(2.0, 4.5);
    (perp, lend)
}

/// Open a short of `size` ETH at `entry` on the paper venue.
async fn seed_short(perp: &PaperVenue, size: f64, entry: f64) {
    perp.place_order(&OrderRequest {
        symbol: "ETH".into(),
        side: Side::Sell,
        order_type: OrderType::Limit,
        size: BaseQty(size),
        price: Some(Price(entry)),
        tif: Tif::Gtc,
        reduce_only: false,
        client_order_id: "seed-short".into(),
    })
    .await
    .unwrap();
}

// ── Entry ───────────────────────────────────────────────────────────

#[tokio::test]
async fn opens_at_the_leverage_that_lands_on_target_hf() {
    let (perp, lend) = venues(0.0003);
    lend.set_account(Usd(1000.0), Usd(0.0));
    let mut controller = DeltaNeutralController::new(leveraged_config(), perp.clone(), lend.clone());

    let action = controller.tick(1000).await.unwrap();
    // L = 1 + 0.8 / 2.0 = 1.4
    match action {
        ControllerAction::Opened { notional, leverage } => {
            assert!((leverage - 1.4).abs() < 1e-9);
            assert!((notional.0 - 1400.0).abs() < 1e-6);
        }
        other => panic!("expected open, got {other:?}"),
    }
    // Short perp sized to the notional
    let qty = perp.position_qty("ETH");
    assert!((qty.0 + 1400.0 / 3000.0).abs() < 1e-9);
    // Borrowed the levered slice
    let account = lend.account().await.unwrap();
    assert!((account.debt.0 - 400.0).abs() < 1e-6);
}

#[tokio::test]
async fn does_not_open_below_the_funding_floor() {
    let (perp, lend) = venues(0.00005);
    lend.set_account(Usd(1000.0), Usd(0.0));
    let mut controller = DeltaNeutralController::new(leveraged_config(), perp.clone(), lend);

    let action = controller.tick(1000).await.unwrap();
    assert_eq!(action, ControllerAction::None);
    assert!(perp.position_qty("ETH").0.abs() < 1e-12);
}

// ── Scenario S4: rescue-and-releverage ──────────────────────────────

#[tokio::test]
async fn s4_rescue_realizes_the_deficit_and_preserves_delta() {
    let (perp, lend) = venues(0.0003);
    // Short 5 ETH entered at 3100, mark 3000: +$500 unrealized
    seed_short(&perp, 5.0, 3100.0).await;
    // HF = 450 × 0.8 / 300 = 1.2, below emergency 1.3; deficit to
    // target-HF collateral is 2.0 × 300 / 0.8 − 450 = $300
    lend.set_account(Usd(450.0), Usd(300.0));
    let mut controller = DeltaNeutralController::new(leveraged_config(), perp.clone(), lend.clone());

    let action = controller.tick(2000).await.unwrap();
    match action {
        ControllerAction::RescueReleverage { realized, deposited } => {
            // Realize deficit / 0.9 ≈ $333, deposit 90% of it = $300
            assert!((realized.0 - 300.0 / 0.9).abs() < 1.0, "realized {realized}");
            assert!((deposited.0 - 300.0).abs() < 1.0, "deposited {deposited}");
        }
        other => panic!("expected rescue, got {other:?}"),
    }

    // Rescue invariant: HF back within 95% of target, delta unchanged
    let account = lend.account().await.unwrap();
    let hf_after = account.health_factor();
    assert!(
        hf_after.value() >= 2.0 * 0.95,
        "HF after rescue {hf_after} below 95% of target"
    );
    let qty = perp.position_qty("ETH");
    assert!(
        (qty.0 + 5.0).abs() < 1e-6,
        "perp size changed across rescue: {qty}"
    );
}

#[tokio::test]
async fn unprofitable_perp_forces_full_deleverage_below_emergency() {
    let (perp, lend) = venues(0.0003);
    // Entered at 2900, mark 3000: the short is $500 under water
    seed_short(&perp, 5.0, 2900.0).await;
    lend.set_account(Usd(450.0), Usd(300.0));
    let mut controller = DeltaNeutralController::new(leveraged_config(), perp.clone(), lend.clone());

    let action = controller.tick(2000).await.unwrap();
    assert_eq!(action, ControllerAction::Deleveraged);
    assert!(perp.position_qty("ETH").0.abs() < 1e-9);
    let account = lend.account().await.unwrap();
    assert!(account.debt.0 < 1e-9, "debt not repaid: {}", account.debt);
}

// ── Carry gates ─────────────────────────────────────────────────────

#[tokio::test]
async fn funding_flip_closes_the_position() {
    let (perp, lend) = venues(-0.0001);
    seed_short(&perp, 2.0, 3000.0).await;
    // Healthy HF so only the carry gate can fire
    lend.set_account(Usd(6000.0), Usd(1000.0));
    let mut controller = DeltaNeutralController::new(leveraged_config(), perp.clone(), lend.clone());

    let action = controller.tick(3000).await.unwrap();
    assert!(
        matches!(action, ControllerAction::Closed { .. }),
        "expected close on funding flip, got {action:?}"
    );
    assert!(perp.position_qty("ETH").0.abs() < 1e-9);
}

#[tokio::test]
async fn healthy_position_with_carry_is_left_alone() {
    let (perp, lend) = venues(0.0003);
    seed_short(&perp, 2.0, 3000.0).await;
    // HF = 16000 × 0.8 / 1000 = 12.8; spot leg sized to the perp
    lend.set_account(Usd(6000.0), Usd(1000.0));
    let mut controller = DeltaNeutralController::new(leveraged_config(), perp.clone(), lend);

    let action = controller.tick(4000).await.unwrap();
    assert_eq!(action, ControllerAction::None);
    assert!((perp.position_qty("ETH").0 + 2.0).abs() < 1e-9);
}
