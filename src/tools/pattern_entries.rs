use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PatternEntriesParams {
    #[schemars(description = "ID of the pattern, as returned by list_patterns")]
    pub pattern_id: String,
}
