//! Parameters for the ingestion hook tools: `entry_created`,
//! `entry_updated` and `entry_deleted`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EntryCreatedParams {
    #[schemars(description = "ID of the newly saved entry")]
    pub entry_id: i64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EntryUpdatedParams {
    #[schemars(description = "ID of the entry whose text changed")]
    pub entry_id: i64,

    /// Which text variant was (re)generated.
    #[schemars(description = "Granularity that changed: 'full_text' (raw text edited), 'summary' (enhanced or structured text produced), or 'sentence'")]
    pub granularity: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EntryDeletedParams {
    #[schemars(description = "ID of the deleted entry")]
    pub entry_id: i64,
}
