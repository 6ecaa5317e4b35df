//! Campaign configuration export.
//!
//! Turns a marketer's selection of category ids into the targeting document
//! handed to the ads tooling.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::category::{CategoryRecord, CategoryType};

static SIZE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:[,.\s]\d{3})+|\d+").expect("valid size regex"));

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    pub name: String,
    #[serde(default)]
    pub objective: Option<String>,
    pub category_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignConfig {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    pub created_at: DateTime<Utc>,
    pub targeting: Targeting,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown_ids: Vec<String>,
    pub estimated_audience: Option<u64>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Targeting {
    pub demographics: Vec<TargetingEntry>,
    pub interests: Vec<TargetingEntry>,
    pub behaviors: Vec<TargetingEntry>,
}

impl Targeting {
    fn bucket(&mut self, category_type: Option<CategoryType>) -> &mut Vec<TargetingEntry> {
        match category_type {
            Some(CategoryType::Demographics) => &mut self.demographics,
            Some(CategoryType::Behaviors) => &mut self.behaviors,
            Some(CategoryType::Interests) | None => &mut self.interests,
        }
    }

    pub fn len(&self) -> usize {
        self.demographics.len() + self.interests.len() + self.behaviors.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetingEntry {
    pub id: String,
    pub name: String,
    pub path: Vec<String>,
    pub size: String,
}

/// Assemble the export for `request` from the current category records.
pub fn build_campaign(
    request: &CampaignRequest,
    records: &[CategoryRecord],
    paths: &HashMap<String, Vec<String>>,
) -> CampaignConfig {
    let by_id: HashMap<&str, &CategoryRecord> =
        records.iter().map(|r| (r.id.as_str(), r)).collect();

    let mut targeting = Targeting::default();
    let mut unknown_ids = Vec::new();
    let mut known: BTreeSet<&str> = BTreeSet::new();
    let mut estimated_audience: Option<u64> = None;

    for id in &request.category_ids {
        let found = by_id
            .get(id.as_str())
            .or_else(|| by_id.get(id.trim()));
        let Some(record) = found else {
            if !unknown_ids.contains(id) {
                unknown_ids.push(id.clone());
            }
            continue;
        };
        if !known.insert(record.id.as_str()) {
            continue;
        }

        if let Some(size) = parse_audience_size(&record.size) {
            estimated_audience = Some(estimated_audience.map_or(size, |cur| cur.max(size)));
        }

        targeting.bucket(record.category_type).push(TargetingEntry {
            id: record.id.clone(),
            name: record.name.clone(),
            path: paths
                .get(&record.id)
                .cloned()
                .unwrap_or_else(|| vec![record.name.clone()]),
            size: record.size.clone(),
        });
    }

    CampaignConfig {
        id: format!("cmp_{}", Uuid::new_v4().simple()),
        name: request.name.trim().to_string(),
        objective: request.objective.clone(),
        created_at: Utc::now(),
        targeting,
        unknown_ids,
        estimated_audience,
        fingerprint: fingerprint(known.iter().copied()),
    }
}

/// Read the first number out of a free-text size such as `"Size: 1,045,931"`.
pub fn parse_audience_size(size: &str) -> Option<u64> {
    let m = SIZE_NUMBER.find(size)?;
    m.as_str()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()
}

/// SHA-256 over the sorted id set; identical selections share a fingerprint.
fn fingerprint<'a>(sorted_ids: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for id in sorted_ids {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
