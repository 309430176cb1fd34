pub mod analyze_patterns;
pub mod entry_hooks;
pub mod keyword_entries;
pub mod list_patterns;
pub mod pattern_availability;
pub mod pattern_entries;
pub mod retrieve_entries;

use analyze_patterns::AnalyzePatternsParams;
use chrono::{NaiveDate, Utc};
use entry_hooks::{EntryCreatedParams, EntryDeletedParams, EntryUpdatedParams};
use keyword_entries::KeywordEntriesParams;
use list_patterns::ListPatternsParams;
use pattern_availability::PatternAvailabilityParams;
use pattern_entries::PatternEntriesParams;
use retrieve_entries::RetrieveEntriesParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use serde::Serialize;

use crate::engine::MemoryEngine;
use crate::memory::scheduler::AnalysisMode;
use crate::memory::temporal::resolve_date_filter;
use crate::memory::types::{DateRange, Granularity, PatternType};

/// Upper bound on `max_results` accepted from a client.
const MAX_RESULTS_CAP: usize = 50;

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

fn parse_day(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("invalid date '{raw}', expected YYYY-MM-DD"))
}

/// Resolve the date constraint of a retrieval request. `None` lets the
/// pipeline look for a date phrase inside the query itself.
fn date_range(params: &RetrieveEntriesParams) -> Result<Option<DateRange>, String> {
    match (&params.start_date, &params.end_date) {
        (Some(start), Some(end)) => Ok(Some(DateRange::days(parse_day(start)?, parse_day(end)?))),
        (None, None) => Ok(params
            .date_filter
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .map(|f| resolve_date_filter(f, Utc::now().date_naive()))),
        _ => Err("start_date and end_date must be given together".into()),
    }
}

/// The echo-memory MCP tool handler. Every tool is a thin adapter over the
/// shared [`MemoryEngine`].
#[derive(Clone)]
pub struct EchoTools {
    tool_router: ToolRouter<Self>,
    engine: MemoryEngine,
}

#[tool_router]
impl EchoTools {
    pub fn new(engine: MemoryEngine) -> Self {
        Self {
            tool_router: Self::tool_router(),
            engine,
        }
    }

    /// Search journal entries by meaning.
    #[tool(description = "Search the user's journal entries by natural language. Returns entry ids ranked by relevance, with recent entries slightly favoured. An empty result means nothing relevant was written; say so instead of guessing.")]
    async fn retrieve_entries(
        &self,
        Parameters(params): Parameters<RetrieveEntriesParams>,
    ) -> Result<String, String> {
        if params.query.trim().is_empty() {
            return Err("query must not be empty".into());
        }
        let range = date_range(&params)?;
        let limit = params.max_results.map(|n| n.clamp(1, MAX_RESULTS_CAP));

        tracing::info!(query_len = params.query.len(), has_range = range.is_some(), "retrieve_entries called");

        let response = self
            .engine
            .retrieve(&params.query, range, limit)
            .await
            .map_err(|e| format!("retrieval failed: {e}"))?;

        let mut body = serde_json::json!({
            "results": response.results,
            "total": response.results.len(),
            "source": response.source,
            "date_range": response.date_range,
        });
        if response.results.is_empty() {
            body["message"] = "No journal entries matched this query.".into();
        }
        Ok(body.to_string())
    }

    /// Whether pattern insights are unlocked yet.
    #[tool(description = "Check whether pattern insights are available. Patterns unlock once the journal holds enough entries; the response says how many more are needed.")]
    async fn pattern_availability(
        &self,
        Parameters(_params): Parameters<PatternAvailabilityParams>,
    ) -> Result<String, String> {
        let availability = self
            .engine
            .check_pattern_availability()
            .await
            .map_err(|e| format!("availability check failed: {e}"))?;
        to_json(&availability)
    }

    /// List recurring themes.
    #[tool(description = "List discovered patterns (recurring moods, topics, times and habits) with their confidence, keywords and member entries. Only confident patterns are listed.")]
    async fn list_patterns(
        &self,
        Parameters(params): Parameters<ListPatternsParams>,
    ) -> Result<String, String> {
        let wanted: Option<PatternType> = params
            .r#type
            .as_deref()
            .map(str::parse::<PatternType>)
            .transpose()?;

        let availability = self
            .engine
            .check_pattern_availability()
            .await
            .map_err(|e| format!("availability check failed: {e}"))?;

        let mut patterns = self
            .engine
            .list_patterns()
            .await
            .map_err(|e| format!("listing patterns failed: {e}"))?;
        if let Some(t) = wanted {
            patterns.retain(|p| p.pattern_type == t);
        }
        if !params.include_entries.unwrap_or(true) {
            patterns.iter_mut().for_each(|p| p.entry_ids.clear());
        }

        to_json(&serde_json::json!({
            "patterns": patterns,
            "total": patterns.len(),
            "availability": availability,
        }))
    }

    /// Entries behind one pattern.
    #[tool(description = "Get a pattern by id together with its member entry ids, newest first. Works for hidden low-confidence patterns too.")]
    async fn pattern_entries(
        &self,
        Parameters(params): Parameters<PatternEntriesParams>,
    ) -> Result<String, String> {
        let pattern = self
            .engine
            .get_pattern(&params.pattern_id)
            .await
            .map_err(|e| format!("pattern lookup failed: {e}"))?
            .ok_or_else(|| format!("pattern not found: {}", params.pattern_id))?;
        let entry_ids = self
            .engine
            .get_entries_for_pattern(&params.pattern_id)
            .await
            .map_err(|e| format!("pattern lookup failed: {e}"))?;
        let visible = pattern.is_visible(self.engine.config().patterns.visibility_threshold);

        to_json(&serde_json::json!({
            "pattern": pattern,
            "visible": visible,
            "entry_ids": entry_ids,
        }))
    }

    /// Entries for a keyword.
    #[tool(description = "Get entry ids for a keyword, newest first. Uses pattern keywords when a pattern carries it, otherwise a plain text search.")]
    async fn keyword_entries(
        &self,
        Parameters(params): Parameters<KeywordEntriesParams>,
    ) -> Result<String, String> {
        if params.keyword.trim().is_empty() {
            return Err("keyword must not be empty".into());
        }
        let entry_ids = self
            .engine
            .get_entries_for_keyword(&params.keyword)
            .await
            .map_err(|e| format!("keyword lookup failed: {e}"))?;
        to_json(&serde_json::json!({
            "keyword": params.keyword.trim(),
            "entry_ids": entry_ids,
            "total": entry_ids.len(),
        }))
    }

    /// Run pattern analysis now.
    #[tool(description = "Run pattern analysis now. Returns the number of patterns found, or why analysis is not available yet (too few entries, embedding model unavailable).")]
    async fn analyze_patterns(
        &self,
        Parameters(params): Parameters<AnalyzePatternsParams>,
    ) -> Result<String, String> {
        let mode = match params.mode.as_deref().map(str::trim) {
            None | Some("") | Some("full") => AnalysisMode::Full,
            Some("incremental") => AnalysisMode::Incremental,
            Some(other) => return Err(format!("unknown mode: {other}. Use 'full' or 'incremental'")),
        };
        tracing::info!(mode = %mode, "analyze_patterns called");

        let outcome = self
            .engine
            .analyze(mode)
            .await
            .map_err(|e| format!("pattern analysis failed: {e}"))?;
        to_json(&outcome)
    }

    /// Ingestion hook: entry created.
    #[tool(description = "Notify the memory engine that a journal entry was saved. Embedding happens in the background.")]
    async fn entry_created(
        &self,
        Parameters(params): Parameters<EntryCreatedParams>,
    ) -> Result<String, String> {
        self.engine
            .on_entry_created(params.entry_id)
            .await
            .map_err(|e| format!("ingest failed: {e}"))?;
        to_json(&serde_json::json!({ "entry_id": params.entry_id, "status": "accepted" }))
    }

    /// Ingestion hook: entry text changed.
    #[tool(description = "Notify the memory engine that an entry's text changed: 'full_text' after an edit, 'summary' after enhanced or structured text was produced.")]
    async fn entry_updated(
        &self,
        Parameters(params): Parameters<EntryUpdatedParams>,
    ) -> Result<String, String> {
        let granularity: Granularity = params.granularity.trim().parse()?;
        self.engine
            .on_entry_text_updated(params.entry_id, granularity)
            .await
            .map_err(|e| format!("ingest failed: {e}"))?;
        to_json(&serde_json::json!({
            "entry_id": params.entry_id,
            "granularity": granularity,
            "status": "accepted",
        }))
    }

    /// Ingestion hook: entry deleted.
    #[tool(description = "Notify the memory engine that a journal entry was deleted. Its vectors and index rows are dropped.")]
    async fn entry_deleted(
        &self,
        Parameters(params): Parameters<EntryDeletedParams>,
    ) -> Result<String, String> {
        let removed = self
            .engine
            .on_entry_deleted(params.entry_id)
            .await
            .map_err(|e| format!("delete failed: {e}"))?;
        to_json(&serde_json::json!({ "entry_id": params.entry_id, "removed_vectors": removed }))
    }
}

#[tool_handler]
impl ServerHandler for EchoTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Echo is the memory of a private journal. Use retrieve_entries to find what \
                 the user wrote about something, list_patterns for recurring themes, and \
                 pattern_entries or keyword_entries to see the entries behind them."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(date_filter: Option<&str>, start: Option<&str>, end: Option<&str>) -> RetrieveEntriesParams {
        RetrieveEntriesParams {
            query: "dog".into(),
            date_filter: date_filter.map(String::from),
            start_date: start.map(String::from),
            end_date: end.map(String::from),
            max_results: None,
        }
    }

    #[test]
    fn explicit_range_wins() {
        let range = date_range(&params(Some("yesterday"), Some("2026-03-01"), Some("2026-03-07")))
            .unwrap()
            .unwrap();
        assert_eq!(range.start.format("%Y-%m-%d").to_string(), "2026-03-01");
        assert_eq!(range.end.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-03-07 23:59:59");
    }

    #[test]
    fn half_open_range_is_rejected() {
        assert!(date_range(&params(None, Some("2026-03-01"), None)).is_err());
        assert!(date_range(&params(None, Some("March 1st"), Some("2026-03-07"))).is_err());
    }

    #[test]
    fn no_constraint_defers_to_query() {
        assert_eq!(date_range(&params(None, None, None)).unwrap(), None);
        assert_eq!(date_range(&params(Some("  "), None, None)).unwrap(), None);
        assert!(date_range(&params(Some("last week"), None, None)).unwrap().is_some());
    }
}
