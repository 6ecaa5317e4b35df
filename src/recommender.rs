//! LLM-backed category recommendations.
//!
//! Given a campaign brief and the candidate categories, ask the model for a
//! ranked subset and keep only answers that name real candidates.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::category::CategoryRecord;
use crate::config::RecommenderConfig;
use crate::openrouter::{Message, OpenRouterClient};

/// One suggested category.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub name: String,
    pub path: Vec<String>,
    pub relevance: f64,
    pub justification: String,
}

/// Recommendation pipeline orchestrator.
pub struct Recommender {
    client: OpenRouterClient,
}

impl Recommender {
    pub fn new(client: OpenRouterClient) -> Self {
        Self { client }
    }

    /// Rank `candidates` against `brief`.
    ///
    /// Candidates go in the system message (stable, cacheable prefix); the
    /// brief and instructions go in the user message.
    pub async fn recommend(
        &self,
        brief: &str,
        candidates: &[CategoryRecord],
        paths: &HashMap<String, Vec<String>>,
        config: &RecommenderConfig,
        max_results: Option<usize>,
    ) -> Result<Vec<Recommendation>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            "Requesting recommendations over {} candidates using config: {}",
            candidates.len(),
            config.name
        );

        let system_prompt = format!(
            "{}\n\n--- CATEGORIES START ---\n{}\n--- CATEGORIES END ---",
            config.prompts.system,
            render_candidates(candidates, paths)
        );
        let user_prompt = format!(
            "--- CAMPAIGN START ---\n{}\n--- CAMPAIGN END ---\n\n{}",
            brief.trim(),
            config.prompts.instructions
        );

        let client = match &config.model {
            Some(model) => self.client.clone().with_model(model.clone()),
            None => self.client.clone(),
        };
        let response = client
            .chat(vec![Message::system(system_prompt), Message::user(user_prompt)])
            .await?;
        debug!("Raw LLM response length: {} chars", response.len());

        let raw: RawRecommendations =
            parse_llm_json(&response).context("Failed to parse LLM recommendation response")?;

        let limit = max_results.unwrap_or(config.max_results);
        let ranked = rank(raw.recommendations, candidates, paths, config.min_relevance, limit);
        info!("Returning {} recommendations", ranked.len());
        Ok(ranked)
    }
}

/// One line per candidate: `id | type | path | size`.
fn render_candidates(
    candidates: &[CategoryRecord],
    paths: &HashMap<String, Vec<String>>,
) -> String {
    candidates
        .iter()
        .map(|c| {
            let path = paths
                .get(&c.id)
                .map(|p| p.join(" > "))
                .unwrap_or_else(|| c.name.clone());
            let kind = c.category_type.map(|t| t.as_str()).unwrap_or("-");
            let size = if c.size.is_empty() { "Unknown" } else { c.size.as_str() };
            format!("{} | {} | {} | {}", c.id, kind, path, size)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Filter the model's answer down to known candidates and order it.
fn rank(
    raw: Vec<RawRecommendation>,
    candidates: &[CategoryRecord],
    paths: &HashMap<String, Vec<String>>,
    min_relevance: f64,
    limit: usize,
) -> Vec<Recommendation> {
    let by_id: HashMap<&str, &CategoryRecord> =
        candidates.iter().map(|c| (c.id.as_str(), c)).collect();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for item in raw {
        let id = item.id.trim();
        let Some(record) = by_id.get(id) else {
            warn!("LLM suggested unknown category '{}', skipping", id);
            continue;
        };
        if !seen.insert(id.to_string()) {
            continue;
        }

        let relevance = if item.relevance.is_finite() {
            item.relevance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if relevance < min_relevance {
            continue;
        }

        out.push(Recommendation {
            id: record.id.clone(),
            name: record.name.clone(),
            path: paths
                .get(&record.id)
                .cloned()
                .unwrap_or_else(|| vec![record.name.clone()]),
            relevance,
            justification: item.justification.trim().to_string(),
        });
    }

    out.sort_by(|a, b| {
        b.relevance
            .total_cmp(&a.relevance)
            .then_with(|| a.id.cmp(&b.id))
    });
    out.truncate(limit);
    out
}

// ============================================================================
// Helper types for LLM response parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawRecommendations {
    #[serde(default)]
    recommendations: Vec<RawRecommendation>,
}

#[derive(Debug, Deserialize)]
struct RawRecommendation {
    id: String,
    #[serde(default, alias = "score")]
    relevance: f64,
    #[serde(default, alias = "reason")]
    justification: String,
}

fn parse_llm_json<T: serde::de::DeserializeOwned>(response: &str) -> Result<T> {
    // Try to extract JSON from markdown code blocks if present
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    };

    serde_json::from_str(json_str).context(format!(
        "Invalid recommendation JSON: {}",
        &json_str.chars().take(200).collect::<String>()
    ))
}
