use multidexing::EntityRecord;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, EntityRecord)]
pub struct Balance {
    pub id: String,
    pub amount: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, EntityRecord)]
#[entity(kind = "Pool")]
pub struct Pool {
    #[entity(id)]
    pub address: String,
    pub swaps: u64,
    pub volume: u64,
}

/// Log of every event a `Ping` handler saw, in commit order
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EntityRecord)]
pub struct Journal {
    pub id: String,
    pub entries: Vec<String>,
}
