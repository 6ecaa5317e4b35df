//! Category import: parse a source file, validate it through the hierarchy
//! builder, and upsert by id.
//!
//! Imports are idempotent. Nothing is cleared first; re-importing the same
//! file rewrites the same documents.

use std::io::Cursor;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::category::{
    blank_root_parent, parse_level, parse_records, CategoryRecord, CategoryType, ContractViolation,
};
use crate::category_store::CategoryStore;
use crate::hierarchy::{self, Warning};

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"));

/// Outcome of one import run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub received: usize,
    pub written: usize,
    pub skipped_duplicates: usize,
    pub dry_run: bool,
    pub orphans: Vec<String>,
    pub warnings: Vec<Warning>,
}

/// Dispatch file parsing by extension.
pub fn parse_file(filename: &str, data: &[u8]) -> Result<Vec<CategoryRecord>> {
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "json" => {
            let value: Value =
                serde_json::from_slice(data).context("Import file is not valid JSON")?;
            Ok(parse_json(&value)?)
        }
        "csv" => parse_csv(data),
        "xlsx" | "xlsm" => parse_xlsx(data),
        _ => anyhow::bail!(
            "Unsupported file type: .{}. Supported: .json, .csv, .xlsx, .xlsm",
            ext
        ),
    }
}

/// Accept either a flat record array or a nested tree whose objects carry
/// `children`. Nested input gets `parentId` and `level` from its position.
pub fn parse_json(value: &Value) -> Result<Vec<CategoryRecord>, ContractViolation> {
    let items = value.as_array().ok_or(ContractViolation::NotAList)?;
    let nested = items
        .iter()
        .any(|item| item.get("children").map(Value::is_array).unwrap_or(false));
    if !nested {
        return parse_records(value);
    }

    let mut flat = Vec::new();
    flatten_nested(items, None, 1, None, &mut flat);
    parse_records(&Value::Array(flat))
}

fn flatten_nested(
    items: &[Value],
    parent_id: Option<&str>,
    level: u32,
    inherited_type: Option<&str>,
    out: &mut Vec<Value>,
) {
    for item in items {
        let Value::Object(obj) = item else {
            out.push(item.clone());
            continue;
        };

        let mut obj = obj.clone();
        let children = obj.remove("children");
        let category_type = obj
            .get("categoryType")
            .and_then(Value::as_str)
            .or(inherited_type)
            .map(str::to_string);

        if let Some(t) = &category_type {
            obj.entry("categoryType").or_insert_with(|| Value::String(t.clone()));
        }
        obj.entry("level").or_insert_with(|| Value::from(level));
        if let Some(pid) = parent_id {
            obj.entry("parentId").or_insert_with(|| Value::String(pid.to_string()));
        }
        if !obj.contains_key("id") {
            if let Some(name) = obj.get("name").and_then(Value::as_str) {
                let anchor = parent_id.or(category_type.as_deref());
                obj.insert("id".to_string(), Value::String(derive_id(anchor, name)));
            }
        }

        let id = obj.get("id").and_then(Value::as_str).map(str::to_string);
        out.push(Value::Object(obj));

        if let Some(Value::Array(children)) = children {
            flatten_nested(
                &children,
                id.as_deref(),
                level + 1,
                category_type.as_deref(),
                out,
            );
        }
    }
}

/// Stable id from the parent (or type) plus a slug of the name.
pub fn derive_id(anchor: Option<&str>, name: &str) -> String {
    let slug = slugify(name);
    match anchor {
        Some(anchor) if !anchor.is_empty() => format!("{}-{}", anchor, slug),
        _ => slug,
    }
}

fn slugify(text: &str) -> String {
    NON_SLUG
        .replace_all(&text.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Column positions resolved from a header row.
struct Columns {
    id: Option<usize>,
    name: Option<usize>,
    parent_id: Option<usize>,
    level: Option<usize>,
    size: Option<usize>,
    category_type: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &[String]) -> Result<Self> {
        let find = |aliases: &[&str]| {
            headers.iter().position(|h| {
                let h = h.trim().to_lowercase().replace([' ', '-'], "_");
                aliases.contains(&h.as_str())
            })
        };

        let columns = Self {
            id: find(&["id"]),
            name: find(&["name", "category", "label"]),
            parent_id: find(&["parent_id", "parentid", "parent"]),
            level: find(&["level", "depth"]),
            size: find(&["size", "audience_size"]),
            category_type: find(&["category_type", "categorytype", "type"]),
        };

        if columns.id.is_none() && columns.name.is_none() {
            anyhow::bail!("Tabular import needs an 'id' or 'name' column");
        }
        if columns.level.is_none() {
            anyhow::bail!("Tabular import needs a 'level' column");
        }
        Ok(columns)
    }
}

/// Turn tabular rows into records. Rows are 0-indexed data rows.
fn rows_to_records(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<CategoryRecord>> {
    let columns = Columns::from_headers(headers)?;
    let cell = |row: &Vec<String>, col: Option<usize>| -> String {
        col.and_then(|c| row.get(c))
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    };

    let mut records = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        if row.iter().all(|v| v.trim().is_empty()) {
            continue;
        }

        let raw_level = cell(row, columns.level);
        if raw_level.is_empty() {
            return Err(ContractViolation::MissingField {
                index,
                field: "level",
            }
            .into());
        }
        let level = parse_level(&Value::String(raw_level)).map_err(|reason| {
            ContractViolation::InvalidField {
                index,
                field: "level",
                reason,
            }
        })?;

        let name = cell(row, columns.name);
        let parent_id = columns
            .parent_id
            .and_then(|_| blank_root_parent(Some(cell(row, columns.parent_id)), level));

        let raw_type = cell(row, columns.category_type);
        let category_type = if raw_type.is_empty() {
            None
        } else {
            Some(CategoryType::parse(&raw_type).ok_or_else(|| {
                ContractViolation::InvalidField {
                    index,
                    field: "categoryType",
                    reason: format!("unknown category type '{}'", raw_type),
                }
            })?)
        };

        let mut id = cell(row, columns.id);
        if id.is_empty() && !name.is_empty() {
            let anchor = parent_id
                .as_deref()
                .filter(|p| !p.is_empty())
                .or(category_type.map(|t| t.as_str()));
            id = derive_id(anchor, &name);
        }
        if id.is_empty() {
            return Err(ContractViolation::MissingField { index, field: "id" }.into());
        }

        records.push(CategoryRecord {
            id,
            name,
            parent_id,
            level,
            size: cell(row, columns.size),
            category_type,
        });
    }

    Ok(records)
}

fn parse_csv(data: &[u8]) -> Result<Vec<CategoryRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(true)
        .from_reader(data);

    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV headers")?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.context("Failed to read CSV record")?;
        rows.push(record.iter().map(|f| f.to_string()).collect());
    }

    rows_to_records(&headers, &rows)
}

/// First worksheet with data wins; first row is the header.
fn parse_xlsx(data: &[u8]) -> Result<Vec<CategoryRecord>> {
    let mut workbook: Xlsx<_> =
        open_workbook_from_rs(Cursor::new(data)).context("Failed to open Excel workbook")?;

    for name in workbook.sheet_names().to_vec() {
        let range = match workbook.worksheet_range(&name) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping sheet '{}': {}", name, e);
                continue;
            }
        };

        let mut rows = range
            .rows()
            .map(|row| row.iter().map(cell_to_string).collect::<Vec<String>>());
        let Some(headers) = rows.next() else {
            continue;
        };
        if headers.iter().all(|h| h.is_empty()) {
            continue;
        }
        let rows: Vec<Vec<String>> = rows.collect();
        if rows.is_empty() {
            continue;
        }

        info!("Importing categories from sheet '{}'", name);
        return rows_to_records(&headers, &rows);
    }

    anyhow::bail!("No sheets with data found in workbook")
}

/// Convert a calamine cell to a string representation.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            // Avoid trailing ".0" for whole numbers
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                format!("{}", *f as i64)
            } else {
                format!("{}", f)
            }
        }
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Validate `records` with the hierarchy builder and upsert them.
///
/// Later records with an already-seen id are not written. Orphans are
/// written (they are data, not garbage) but listed in the report.
pub async fn import_records(
    store: &dyn CategoryStore,
    records: Vec<CategoryRecord>,
    dry_run: bool,
) -> Result<ImportReport> {
    let received = records.len();
    let validation = hierarchy::build(&records);

    let mut seen = std::collections::HashSet::new();
    let unique: Vec<CategoryRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect();
    let skipped_duplicates = received - unique.len();

    for warning in &validation.warnings {
        warn!("Import: {:?} on '{}': {}", warning.code, warning.id, warning.detail);
    }

    let written = if dry_run {
        0
    } else {
        store.upsert_batch(&unique).await?
    };

    info!(
        "Import complete: {} received, {} written, {} duplicates, {} orphans, {} warnings (store={}, dry_run={})",
        received,
        written,
        skipped_duplicates,
        validation.orphans.len(),
        validation.warnings.len(),
        store.name(),
        dry_run
    );

    Ok(ImportReport {
        received,
        written,
        skipped_duplicates,
        dry_run,
        orphans: validation.orphans.into_iter().map(|r| r.id).collect(),
        warnings: validation.warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category_store::MemoryCategoryStore;
    use crate::hierarchy::WarningCode;
    use serde_json::json;

    #[test]
    fn test_parse_flat_json() {
        let data = br#"[{"id": "a", "level": 1}, {"id": "b", "parentId": "a", "level": 2}]"#;
        let records = parse_file("categories.json", data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].parent_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_parse_nested_json_derives_fields() {
        let value = json!([{
            "name": "Interests",
            "categoryType": "interests",
            "children": [
                {"name": "Food & Drink", "size": "Size: 10", "children": [
                    {"id": "int-wine", "name": "Wine"}
                ]}
            ]
        }]);

        let records = parse_json(&value).unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["interests-interests", "interests-interests-food-drink", "int-wine"]);
        assert_eq!(records[0].parent_id, None);
        assert_eq!(records[1].parent_id.as_deref(), Some("interests-interests"));
        assert_eq!(records[2].parent_id.as_deref(), Some("interests-interests-food-drink"));
        assert_eq!(records[2].level, 3);
        assert_eq!(records[2].category_type, Some(CategoryType::Interests));
        assert_eq!(records[1].size, "Size: 10");
    }

    #[test]
    fn test_parse_csv_with_aliases_and_derived_ids() {
        let csv_data = b"ID,Name,Parent ID,Level,Audience Size,Type\n\
demographics,Demographics,,1,Unknown,demographics\n\
,Parents,demographics,2,\"Size: 1,045,931\",demographic\n\
\n";
        let records = parse_file("cats.csv", csv_data).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].id, "demographics-parents");
        assert_eq!(records[1].size, "Size: 1,045,931");
        assert_eq!(records[1].category_type, Some(CategoryType::Demographics));
        assert_eq!(records[0].parent_id, None);
    }

    #[test]
    fn test_csv_missing_level_is_contract_violation() {
        let csv_data = b"id,name,level\na,A,1\nb,B,\n";
        let err = parse_file("cats.csv", csv_data).unwrap_err();
        let violation = err.downcast_ref::<ContractViolation>().unwrap();
        assert_eq!(
            violation,
            &ContractViolation::MissingField {
                index: 1,
                field: "level"
            }
        );
    }

    #[test]
    fn test_csv_blank_parent_below_root_stays_unresolved() {
        let csv_data = b"id,name,parent_id,level
root,Root,,1
x,X,,3
";
        let records = parse_file("cats.csv", csv_data).unwrap();
        assert_eq!(records[0].parent_id, None);
        assert_eq!(records[1].parent_id.as_deref(), Some(""));

        let built = crate::hierarchy::build(&records);
        assert_eq!(built.orphans.len(), 1);
        assert_eq!(built.orphans[0].id, "x");
    }

    #[test]
    fn test_csv_requires_level_column() {
        assert!(parse_file("cats.csv", b"id,name\na,A\n").is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(parse_file("cats.html", b"<html>").is_err());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  Food & Drink!! "), "food-drink");
        assert_eq!(derive_id(Some("interests"), "Yoga"), "interests-yoga");
        assert_eq!(derive_id(None, "Yoga"), "yoga");
    }

    #[tokio::test]
    async fn test_import_is_idempotent_upsert() {
        let store = MemoryCategoryStore::new();
        let records = vec![
            CategoryRecord::new("a", None, 1),
            CategoryRecord::new("b", Some("a"), 2),
            CategoryRecord::new("b", Some("a"), 2).with_name("dup"),
            CategoryRecord::new("x", Some("missing"), 3),
        ];

        let report = import_records(&store, records.clone(), false).await.unwrap();
        assert_eq!(report.received, 4);
        assert_eq!(report.written, 3);
        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(report.orphans, vec!["x"]);
        assert!(report.warnings.iter().any(|w| w.code == WarningCode::DuplicateId));

        let again = import_records(&store, records, false).await.unwrap();
        assert_eq!(again.written, 3);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get("b").await.unwrap().unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let store = MemoryCategoryStore::new();
        let report = import_records(&store, vec![CategoryRecord::new("a", None, 1)], true)
            .await
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.written, 0);
        assert_eq!(store.len(), 0);
    }
}
