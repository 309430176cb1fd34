//! MCP `analyze_patterns` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `analyze_patterns` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AnalyzePatternsParams {
    /// `"full"` (default) re-clusters everything; `"incremental"` fits new
    /// entries to existing patterns.
    #[schemars(description = "Analysis mode: 'full' (default) or 'incremental'")]
    pub mode: Option<String>,
}
