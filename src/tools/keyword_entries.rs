use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct KeywordEntriesParams {
    #[schemars(description = "Keyword to look up, e.g. a pattern keyword such as 'interview' (case-insensitive)")]
    pub keyword: String,
}
