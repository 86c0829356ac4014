//! Venue truth wins: ghost positions we hold locally but the venue does
//! not are destroyed, venue positions matching a pending plan are adopted
//! as fills, and anything else is surfaced as a stray.

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

use crate::model::position::{PositionSide, PositionStatus};
use crate::model::units::BaseQty;
use crate::model::{Side, VenueId};
use crate::venues::{OrderStatus, VenuePosition};

use super::incident::SingleLegIncident;
use super::{PairRecord, PairState};

/// A venue position nothing local accounts for.
#[derive(Debug, Clone)]
pub struct UnclaimedStray {
    pub symbol: String,
    pub side: Side,
    pub size: BaseQty,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub ghosts_dropped: u32,
    pub strays_seen: u32,
    pub adopted: u32,
    pub unclaimed_strays: Vec<(VenueId, UnclaimedStray)>,
}

impl ReconcileOutcome {
    /// True when local state actually changed (idempotent reruns return
    /// false).
    pub fn mutated(&self) -> bool {
        self.ghosts_dropped > 0 || self.adopted > 0
    }
}

fn side_matches(local: PositionSide, venue: Side) -> bool {
    matches!(
        (local, venue),
        (PositionSide::Long, Side::Buy) | (PositionSide::Short, Side::Sell)
    )
}

pub fn apply(
    pairs: &mut HashMap<Uuid, PairRecord>,
    orphans: &mut Vec<crate::model::Position>,
    incidents: &mut Vec<SingleLegIncident>,
    venue_positions: &HashMap<VenueId, Vec<VenuePosition>>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    // Per-venue claim flags, same indexing as the input lists
    let mut claimed: HashMap<VenueId, Vec<bool>> = venue_positions
        .iter()
        .map(|(venue, list)| (venue.clone(), vec![false; list.len()]))
        .collect();

    let mut claim = |venue: &VenueId, symbol: &str, side: PositionSide| -> Option<VenuePosition> {
        let list = venue_positions.get(venue)?;
        let flags = claimed.get_mut(venue)?;
        for (i, vp) in list.iter().enumerate() {
            if !flags[i] && vp.symbol == symbol && side_matches(side, vp.side) {
                flags[i] = true;
                return Some(vp.clone());
            }
        }
        None
    };

    // Open pairs: every leg must still exist at its venue
    for pair in pairs.values_mut() {
        match pair.state {
            PairState::Open | PairState::Closing => {}
            _ => continue,
        }
        let mut survivors = 0usize;
        let mut pair_ghosts = 0usize;
        for position in &mut pair.positions {
            if position.status == PositionStatus::Closed {
                continue;
            }
            // No data for this venue this round: leave the leg alone
            if !venue_positions.contains_key(&position.venue) {
                survivors += 1;
                continue;
            }
            match claim(&position.venue, &position.symbol, position.side) {
                Some(vp) => {
                    if (vp.size.0 - position.size.0).abs() > 1e-9 {
                        position.size = vp.size;
                        outcome.adopted += 1;
                    }
                    survivors += 1;
                }
                None => {
                    warn!(
                        venue = %position.venue,
                        symbol = %position.symbol,
                        "ghost leg: venue reports flat; dropping local position"
                    );
                    position.status = PositionStatus::Closed;
                    pair_ghosts += 1;
                    outcome.ghosts_dropped += 1;
                }
            }
        }
        if pair.state == PairState::Open {
            if survivors == 0 && pair_ghosts > 0 {
                pair.state = PairState::Closed;
                pair.close_reason = Some("reconciled: venue flat on both legs".into());
            } else if survivors == 1
                && pair
                    .positions
                    .iter()
                    .any(|p| p.status == PositionStatus::Closed)
            {
                // One leg evaporated at the venue: the survivor is orphaned
                // exposure; hand it to the incident loop
                pair.state = PairState::Failed;
                pair.close_reason = Some("reconciled: single leg remains".into());
                if let Some(survivor) = pair
                    .positions
                    .iter()
                    .find(|p| p.status != PositionStatus::Closed)
                {
                    incidents.push(SingleLegIncident {
                        id: Uuid::new_v4(),
                        pair_id: pair.id,
                        symbol: survivor.symbol.clone(),
                        venue: survivor.venue.clone(),
                        reduce_side: match survivor.side {
                            PositionSide::Long => Side::Sell,
                            PositionSide::Short => Side::Buy,
                        },
                        size: survivor.size,
                        created_at: chrono::Utc::now().timestamp(),
                        attempts: 0,
                        resolved: false,
                    });
                }
            }
        }
    }

    // Orphans restored from persistence: keep only what the venue confirms
    orphans.retain(|orphan| {
        if !venue_positions.contains_key(&orphan.venue) {
            return true;
        }
        match claim(&orphan.venue, &orphan.symbol, orphan.side) {
            Some(_) => true,
            None => {
                warn!(venue = %orphan.venue, symbol = %orphan.symbol, "dropping ghost orphan");
                outcome.ghosts_dropped += 1;
                false
            }
        }
    });

    // Pending plans may have filled while we were not looking: adopt
    for pair in pairs.values_mut() {
        if !matches!(pair.state, PairState::Submitting | PairState::Partial) {
            continue;
        }
        for leg in [&mut pair.long_leg, &mut pair.short_leg] {
            if leg.is_fully_filled() {
                // Keep its venue position claimed either way
                let side = match leg.side {
                    Side::Buy => PositionSide::Long,
                    Side::Sell => PositionSide::Short,
                };
                let _ = claim(&leg.venue, &pair.plan.opportunity.symbol, side);
                continue;
            }
            let side = match leg.side {
                Side::Buy => PositionSide::Long,
                Side::Sell => PositionSide::Short,
            };
            if let Some(vp) = claim(&leg.venue, &pair.plan.opportunity.symbol, side) {
                leg.status = Some(OrderStatus::Filled {
                    filled: vp.size,
                    avg_price: vp.entry_price,
                });
                outcome.adopted += 1;
            }
        }
    }

    // Whatever is left unclaimed is a stray
    for (venue, list) in venue_positions {
        let flags = &claimed[venue];
        for (i, vp) in list.iter().enumerate() {
            if !flags[i] {
                outcome.strays_seen += 1;
                outcome.unclaimed_strays.push((
                    venue.clone(),
                    UnclaimedStray {
                        symbol: vp.symbol.clone(),
                        side: vp.side,
                        size: vp.size,
                    },
                ));
            }
        }
    }

    outcome
}
