//! MCP `list_patterns` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `list_patterns` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListPatternsParams {
    /// Restrict to one pattern type.
    #[schemars(description = "Optional type filter: 'mood', 'topic', 'temporal', 'behavior'")]
    pub r#type: Option<String>,

    #[schemars(description = "If false, omit member entry ids to keep the response small. Defaults to true.")]
    pub include_entries: Option<bool>,
}
