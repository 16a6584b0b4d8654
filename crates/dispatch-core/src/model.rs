use std::collections::BTreeSet;

use uuid::Uuid;

/// A build request, as reread with authority from `get_job` rather than
/// trusted from the `start` event's payload (§4.5's matching algorithm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    pub drv: String,
    pub system: String,
    pub required_features: BTreeSet<String>,
}

/// The literal system tag meaning "any system will do".
pub const BUILTIN_SYSTEM: &str = "builtin";
