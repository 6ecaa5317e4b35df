//! Category record types and the JSON boundary they cross.
//!
//! Records arrive as loosely typed JSON from import files and the store.
//! [`parse_records`] is the only place that rejects malformed input; everything
//! past it works on typed [`CategoryRecord`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One targeting option as stored in the category collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Depth hint from the data source (1 = root). Not authoritative.
    pub level: u32,
    /// Free-text audience size, e.g. `"Size: 1,045,931"`. Display only.
    #[serde(default)]
    pub size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_type: Option<CategoryType>,
}

impl CategoryRecord {
    pub fn new(id: impl Into<String>, parent_id: Option<&str>, level: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            parent_id: parent_id.map(str::to_string),
            level,
            size: String::new(),
            category_type: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }

    pub fn with_type(mut self, category_type: CategoryType) -> Self {
        self.category_type = Some(category_type);
        self
    }
}

/// Top-level Meta Ads targeting family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryType {
    Demographics,
    Interests,
    Behaviors,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Demographics => "demographics",
            Self::Interests => "interests",
            Self::Behaviors => "behaviors",
        }
    }

    /// Parse a type tag as it appears in query strings and import files.
    /// Accepts singular forms and any casing.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "demographics" | "demographic" => Some(Self::Demographics),
            "interests" | "interest" => Some(Self::Interests),
            "behaviors" | "behavior" | "behaviours" | "behaviour" => Some(Self::Behaviors),
            _ => None,
        }
    }
}

/// A record plus its realized children. Built per request, never stored.
///
/// Parent chains can be arbitrarily deep, so `Clone` and `Drop` walk the
/// subtree with an explicit stack instead of recursing per level.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryNode {
    #[serde(flatten)]
    pub record: CategoryRecord,
    #[serde(default)]
    pub children: Vec<CategoryNode>,
}

impl CategoryNode {
    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// Number of nodes in this subtree, including itself.
    pub fn subtree_len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.children.iter());
        }
        count
    }
}

impl Clone for CategoryNode {
    fn clone(&self) -> Self {
        // Pre-order, children pushed in reverse so they pop in order.
        let mut order = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(node.children.iter().rev());
        }

        // Reverse pre-order sees every descendant before its ancestor; the
        // first child's clone ends up on top of `built`.
        let mut built: Vec<CategoryNode> = Vec::with_capacity(order.len());
        for node in order.into_iter().rev() {
            let split = built.len() - node.children.len();
            let mut children = built.split_off(split);
            children.reverse();
            built.push(CategoryNode {
                record: node.record.clone(),
                children,
            });
        }
        built.pop().unwrap_or_else(|| CategoryNode {
            record: self.record.clone(),
            children: Vec::new(),
        })
    }
}

impl Drop for CategoryNode {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.children);
        while let Some(mut node) = stack.pop() {
            stack.append(&mut node.children);
        }
    }
}

/// Input that breaks the record field contract. Fatal: no partial result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("category input must be a JSON array")]
    NotAList,
    #[error("record {index} is not a JSON object")]
    NotAnObject { index: usize },
    #[error("record {index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("record {index} has invalid `{field}`: {reason}")]
    InvalidField {
        index: usize,
        field: &'static str,
        reason: String,
    },
}

/// Validate a JSON value against the record field contract.
pub fn parse_records(value: &Value) -> Result<Vec<CategoryRecord>, ContractViolation> {
    let items = value.as_array().ok_or(ContractViolation::NotAList)?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_record(index, item))
        .collect()
}

fn parse_record(index: usize, item: &Value) -> Result<CategoryRecord, ContractViolation> {
    let obj = item
        .as_object()
        .ok_or(ContractViolation::NotAnObject { index })?;

    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        None | Some(Value::Null) | Some(Value::String(_)) => {
            return Err(ContractViolation::MissingField { index, field: "id" })
        }
        Some(other) => {
            return Err(ContractViolation::InvalidField {
                index,
                field: "id",
                reason: format!("expected string, got {}", json_kind(other)),
            })
        }
    };

    let level = match obj.get("level") {
        None | Some(Value::Null) => {
            return Err(ContractViolation::MissingField {
                index,
                field: "level",
            })
        }
        Some(value) => parse_level(value).map_err(|reason| ContractViolation::InvalidField {
            index,
            field: "level",
            reason,
        })?,
    };

    let parent_id = match obj.get("parentId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => blank_root_parent(Some(s.clone()), level),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(ContractViolation::InvalidField {
                index,
                field: "parentId",
                reason: format!("expected string or null, got {}", json_kind(other)),
            })
        }
    };

    let category_type = match obj.get("categoryType") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(CategoryType::parse(s).ok_or_else(|| {
            ContractViolation::InvalidField {
                index,
                field: "categoryType",
                reason: format!("unknown category type '{}'", s),
            }
        })?),
        Some(other) => {
            return Err(ContractViolation::InvalidField {
                index,
                field: "categoryType",
                reason: format!("expected string, got {}", json_kind(other)),
            })
        }
    };

    Ok(CategoryRecord {
        id,
        name: text_field(obj.get("name")),
        parent_id,
        level,
        size: text_field(obj.get("size")),
        category_type,
    })
}

/// Scraped root rows carry `""` where other sources write null. Only a level-1
/// record gets that reading; deeper records keep the blank reference and end
/// up as unresolvable orphans.
pub(crate) fn blank_root_parent(parent_id: Option<String>, level: u32) -> Option<String> {
    match parent_id {
        Some(p) if level == 1 && p.trim().is_empty() => None,
        other => other,
    }
}

/// Levels come from scraped data and show up as numbers, floats or strings.
pub(crate) fn parse_level(value: &Value) -> Result<u32, String> {
    let raw = match value {
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(v), _) => v,
            (None, Some(f)) if f.fract() == 0.0 && f >= 0.0 => f as u64,
            _ => return Err(format!("{} is not a positive integer", n)),
        },
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("'{}' is not a positive integer", s))?,
        other => return Err(format!("expected number, got {}", json_kind(other))),
    };

    if raw == 0 || raw > u32::MAX as u64 {
        return Err(format!("{} is not a positive integer", raw));
    }
    Ok(raw as u32)
}

fn text_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
