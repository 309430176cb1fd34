//! MCP `retrieve_entries` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `retrieve_entries` MCP tool.
///
/// The date constraint is taken from `start_date`/`end_date` when given,
/// then from `date_filter`, then from a date phrase inside `query`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RetrieveEntriesParams {
    #[schemars(description = "Natural language question or topic, e.g. 'what was I anxious about last month?'")]
    pub query: String,

    /// A date phrase such as `"last week"` or `"3 days ago"`.
    #[schemars(description = "Optional date phrase: 'today', 'yesterday', 'last week', 'this month', '3 days ago', 'last saturday'")]
    pub date_filter: Option<String>,

    #[schemars(description = "Optional start of an explicit date range (YYYY-MM-DD, inclusive)")]
    pub start_date: Option<String>,

    #[schemars(description = "Optional end of an explicit date range (YYYY-MM-DD, inclusive)")]
    pub end_date: Option<String>,

    #[schemars(description = "Maximum number of entries to return. Defaults to 10.")]
    pub max_results: Option<usize>,
}
