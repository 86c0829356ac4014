use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::units::BaseQty;
use crate::model::{Side, VenueId};

/// One leg filled while the other died. The record carries exactly the
/// reducing order that returns the book to flat; the retry loop owns
/// resolution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SingleLegIncident {
    pub id: Uuid,
    pub pair_id: Uuid,
    pub symbol: String,
    /// Venue carrying the orphaned exposure.
    pub venue: VenueId,
    /// Side of the reducing order that flattens it.
    pub reduce_side: Side,
    pub size: BaseQty,
    pub created_at: i64,
    pub attempts: u32,
    pub resolved: bool,
}

impl SingleLegIncident {
    /// Client order id for the next flatten attempt; distinct per attempt
    /// so a venue-side dedup cannot swallow a retry.
    pub fn flatten_client_id(&self) -> String {
        format!("{}-flat-{}", self.id, self.attempts)
    }
}
