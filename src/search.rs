//! `threadline search` and `threadline first-mention`.
//!
//! Opens the database read-only, resolves the embedding backend that the
//! active index was built with, and runs the core [`Retriever`]. Results
//! print as a numbered list, as JSON, or grouped by conversation.
//!
//! # Backend choice
//!
//! `--backend` wins, then `[embedding] backend`, then the backend recorded
//! in the active index metadata. A mismatch with the index surfaces as
//! `IncompatibleIndex` rather than silently scoring garbage.
//!
//! The query and parameters are checked before any backend is contacted.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use tracing::{debug, warn};

use threadline_core::aggregate::{aggregate_by_conversation, first_mention, narrative_partition};
use threadline_core::corpus::SearchFilters;
use threadline_core::error::IndexError;
use threadline_core::models::{ChunkRole, SearchResult};
use threadline_core::search::{validate_query, Retriever, SearchOutcome, SearchParams, SearchRequest};
use threadline_core::store::IndexStore;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::sqlite_store::{SqliteCorpus, SqliteIndexStore};

/// Default score a first mention must reach when none is configured.
pub const DEFAULT_FIRST_MENTION_THRESHOLD: f32 = 0.5;

/// Filter flags shared by `search` and `first-mention`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct FilterArgs {
    /// Only conversations whose workspace path contains this text.
    #[arg(long)]
    pub workspace: Option<String>,

    /// Only conversations whose model name contains this text.
    #[arg(long)]
    pub model: Option<String>,

    /// Only conversations started on or after this date (YYYY-MM-DD).
    #[arg(long)]
    pub since: Option<String>,

    /// Only conversations started on or before this date (YYYY-MM-DD).
    #[arg(long)]
    pub until: Option<String>,

    /// Require at least one of these tags (repeatable).
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Require every one of these tags (repeatable).
    #[arg(long = "all-tags")]
    pub all_tags: Vec<String>,

    /// Drop conversations carrying any of these tags (repeatable).
    #[arg(long = "exclude-tag")]
    pub exclude_tags: Vec<String>,

    /// Only chunks from this side: `user` or `assistant`.
    #[arg(long)]
    pub role: Option<String>,
}

impl FilterArgs {
    pub fn to_filters(&self) -> Result<SearchFilters> {
        let role = match self.role.as_deref() {
            None => None,
            Some(r) => {
                let role: ChunkRole = r.parse()?;
                if role == ChunkRole::Exchange {
                    anyhow::bail!("--role must be user or assistant");
                }
                Some(role)
            }
        };
        Ok(SearchFilters {
            workspace: self.workspace.clone(),
            model: self.model.clone(),
            since: self.since.as_deref().map(start_of_day).transpose()?,
            until: self.until.as_deref().map(end_of_day).transpose()?,
            tags_any: self.tags.clone(),
            tags_all: self.all_tags.clone(),
            tags_exclude: self.exclude_tags.clone(),
            role,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow!("Invalid date '{}' (expected YYYY-MM-DD): {}", s, e))
}

fn start_of_day(s: &str) -> Result<i64> {
    let date = parse_date(s)?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| anyhow!("Invalid date '{}'", s))
}

fn end_of_day(s: &str) -> Result<i64> {
    let date = parse_date(s)?;
    date.and_hms_opt(23, 59, 59)
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| anyhow!("Invalid date '{}'", s))
}

/// Per-invocation overrides of `[retrieval]` settings.
#[derive(Debug, Clone, Default)]
pub struct ParamOverrides {
    pub recall_n: Option<usize>,
    pub limit: Option<usize>,
    pub lambda: Option<f32>,
    pub no_diversity: bool,
    pub threshold: Option<f32>,
}

impl ParamOverrides {
    pub fn apply(&self, mut params: SearchParams) -> SearchParams {
        if let Some(n) = self.recall_n {
            params.recall_n = n;
        }
        if let Some(limit) = self.limit {
            params.limit = limit;
        }
        if let Some(lambda) = self.lambda {
            params.lambda = lambda;
        }
        if self.no_diversity {
            params.diversity = false;
        }
        if self.threshold.is_some() {
            params.threshold = self.threshold;
        }
        params
    }
}

/// Run one search against the active index, read-only.
pub async fn search(
    config: &Config,
    query: &str,
    filters: &SearchFilters,
    params: SearchParams,
    embeddings_only: bool,
    backend: Option<&str>,
) -> Result<SearchOutcome> {
    validate_query(query)?;
    params.validate()?;

    let pool = db::connect_reader(config).await?;
    let store = SqliteIndexStore::reader(pool.clone());
    let corpus = SqliteCorpus::new(pool.clone());

    let meta = store.read_active_meta().await?.ok_or(IndexError::NotBuilt)?;
    let requested = backend
        .or(config.embedding.backend.as_deref())
        .unwrap_or(meta.backend.as_str());
    debug!(backend = requested, generation = meta.generation, "searching active index");
    let backend = embedding::resolve(config, Some(requested)).await?;

    let request = SearchRequest {
        query,
        filters,
        embeddings_only,
        params,
        now: chrono::Utc::now().timestamp(),
    };
    let outcome = Retriever::new(&store, backend.as_ref(), &corpus, &corpus)
        .search(&request)
        .await;

    pool.close().await;
    let outcome = outcome?;
    if outcome.malformed > 0 {
        warn!(
            skipped = outcome.malformed,
            "skipped stored chunks with unusable vectors; run `threadline index build --rebuild`"
        );
    }
    Ok(outcome)
}

/// Output switches for `threadline search`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputMode {
    pub explain: bool,
    pub by_conversation: bool,
    pub json: bool,
}

/// `threadline search <query>`.
pub async fn run_search(
    config: &Config,
    query: &str,
    filters: &FilterArgs,
    overrides: &ParamOverrides,
    embeddings_only: bool,
    backend: Option<&str>,
    output: OutputMode,
) -> Result<()> {
    let filters = filters.to_filters()?;
    let params = overrides.apply(config.search_params());
    let outcome = search(config, query, &filters, params, embeddings_only, backend).await?;

    if output.by_conversation {
        let partition = narrative_partition(&aggregate_by_conversation(&outcome.results));
        if output.json {
            println!("{}", serde_json::to_string_pretty(&partition)?);
            return Ok(());
        }
        if partition.expanded.is_empty() {
            println!("No results.");
            return Ok(());
        }
        println!("conversations (cut {:.2})", partition.cut);
        for (i, conv) in partition.expanded.iter().enumerate() {
            println!(
                "{}. [{:.2}] {}  {} chunk{}  mean {:.2}",
                i + 1,
                conv.max_score,
                conv.conversation_id,
                conv.chunk_count,
                if conv.chunk_count == 1 { "" } else { "s" },
                conv.mean_score
            );
            println!("    excerpt: \"{}\"", excerpt(&conv.best_excerpt));
            println!();
        }
        if !partition.shortlist.is_empty() {
            println!("also mentioned");
            for conv in &partition.shortlist {
                println!("  - [{:.2}] {}", conv.max_score, conv.conversation_id);
            }
        }
        return Ok(());
    }

    if output.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if outcome.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    if output.explain {
        println!(
            "recall: {}  scored chunks: {}  skipped malformed: {}",
            outcome
                .recalled_conversations
                .map(|n| format!("{} conversations", n))
                .unwrap_or_else(|| "skipped".to_string()),
            outcome.candidates_scored,
            outcome.malformed
        );
        println!();
    }

    for (i, result) in outcome.results.iter().enumerate() {
        print_result(i + 1, result, output.explain);
    }
    Ok(())
}

fn print_result(rank: usize, result: &SearchResult, explain: bool) {
    println!(
        "{}. [{:.2}] {} / {}",
        rank,
        result.score.final_score,
        result.conversation_id,
        result.role
    );
    println!("    date: {}", format_date(result.timestamp));
    println!("    excerpt: \"{}\"", excerpt(&result.text));
    if explain {
        let s = &result.score;
        println!(
            "    score: similarity {:.3}  recency {:+.3}  relevance {:.3}  penalty {:.3}  mmr rank {}  final {:.3}{}",
            s.similarity,
            s.recency_boost,
            s.pre_mmr_score,
            s.mmr_penalty,
            s.mmr_rank,
            s.final_score,
            if result.lexical_match { "  (lexical)" } else { "" }
        );
    }
    println!("    id: {}", result.chunk_id);
    println!();
}

fn format_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

fn excerpt(text: &str) -> String {
    const MAX_CHARS: usize = 240;
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= MAX_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}

/// `threadline first-mention <query>`.
///
/// Scores the whole candidate pool without the diversity rerank, then
/// reports the earliest chunk whose relevance clears the threshold.
pub async fn run_first_mention(
    config: &Config,
    query: &str,
    filters: &FilterArgs,
    threshold: Option<f32>,
    backend: Option<&str>,
    json: bool,
) -> Result<()> {
    let filters = filters.to_filters()?;
    let threshold = threshold
        .or(config.retrieval.threshold)
        .unwrap_or(DEFAULT_FIRST_MENTION_THRESHOLD);

    let mut params = config.search_params();
    params.diversity = false;
    params.limit = params.mmr_pool_cap.max(params.limit);
    let outcome = search(config, query, &filters, params, false, backend).await?;

    let found = first_mention(&outcome.results, threshold);
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
        return Ok(());
    }
    match found {
        Some(result) => {
            println!("first mention (threshold {:.2})", threshold);
            print_result(1, result, false);
        }
        None => println!("No mention scored at or above {:.2}.", threshold),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_bounds_cover_whole_day() {
        let since = start_of_day("2024-03-01").unwrap();
        let until = end_of_day("2024-03-01").unwrap();
        assert_eq!(since, 1_709_251_200);
        assert_eq!(until - since, 86_399);
        assert!(start_of_day("03/01/2024").is_err());
    }

    #[test]
    fn test_filter_args_map_to_filters() {
        let args = FilterArgs {
            workspace: Some("app".into()),
            tags: vec!["auth".into()],
            exclude_tags: vec!["wip".into()],
            role: Some("assistant".into()),
            ..Default::default()
        };
        let filters = args.to_filters().unwrap();
        assert_eq!(filters.workspace.as_deref(), Some("app"));
        assert_eq!(filters.tags_any, vec!["auth"]);
        assert_eq!(filters.tags_exclude, vec!["wip"]);
        assert_eq!(filters.role, Some(ChunkRole::Assistant));

        let bad = FilterArgs {
            role: Some("exchange".into()),
            ..Default::default()
        };
        assert!(bad.to_filters().is_err());
    }

    #[test]
    fn test_overrides_apply() {
        let params = ParamOverrides {
            limit: Some(3),
            lambda: Some(1.0),
            no_diversity: true,
            threshold: Some(0.4),
            ..Default::default()
        }
        .apply(SearchParams::default());
        assert_eq!(params.limit, 3);
        assert_eq!(params.lambda, 1.0);
        assert!(!params.diversity);
        assert_eq!(params.threshold, Some(0.4));
        assert_eq!(params.recall_n, 80);
    }

    #[test]
    fn test_excerpt_flattens_and_caps() {
        assert_eq!(excerpt("a\n\n b\tc"), "a b c");
        let long = "word ".repeat(100);
        let e = excerpt(&long);
        assert!(e.ends_with("..."));
        assert!(e.chars().count() <= 243);
    }
}
