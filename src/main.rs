//! IntelliTarget - Meta Ads targeting category service.

mod campaign;
mod category;
mod category_store;
mod config;
mod hierarchy;
mod importer;
mod openrouter;
mod recommender;
mod supabase;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use campaign::{CampaignConfig, CampaignRequest};
use category::{CategoryNode, CategoryRecord, CategoryType};
use category_store::{CategoryStore, MemoryCategoryStore, StoreKind};
use config::{ConfigStore, RecommenderConfig, ServerSettings};
use hierarchy::{BuildResult, Warning};
use importer::ImportReport;
use openrouter::OpenRouterClient;
use recommender::{Recommendation, Recommender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use supabase::SupabaseCategoryStore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type ApiError = (StatusCode, String);

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn CategoryStore>,
    recommender: Option<Arc<Recommender>>,
    configs: Arc<ConfigStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intellitarget=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = ServerSettings::from_env()?;
    info!("Starting with settings: {:?}", settings);

    let store: Arc<dyn CategoryStore> = match settings.store {
        StoreKind::Memory => Arc::new(MemoryCategoryStore::new()),
        StoreKind::Supabase => Arc::new(SupabaseCategoryStore::from_env()?),
    };
    info!("Category store: {}", store.name());

    if let Some(seed) = &settings.seed_file {
        let data = std::fs::read(seed).with_context(|| format!("Failed to read seed file {:?}", seed))?;
        let filename = seed.to_string_lossy();
        let records = importer::parse_file(&filename, &data)
            .with_context(|| format!("Failed to parse seed file {:?}", seed))?;
        let report = importer::import_records(store.as_ref(), records, false).await?;
        info!(
            "Seeded {} categories from {:?} ({} warnings)",
            report.written,
            seed,
            report.warnings.len()
        );
    }

    let configs = ConfigStore::load_or_default(&settings.config_dir);
    info!("Loaded {} recommender configs: {:?}", configs.list().len(), configs.list());

    let recommender = match OpenRouterClient::from_env() {
        Ok(client) => {
            info!("OpenRouter client initialized (model={})", client.model());
            Some(Arc::new(Recommender::new(client)))
        }
        Err(e) => {
            warn!("Recommendations disabled: {:#}", e);
            None
        }
    };

    let state = AppState {
        store,
        recommender,
        configs: Arc::new(configs),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/categories", get(list_categories))
        .route("/categories/hierarchy", get(get_hierarchy))
        .route("/categories/search", get(search_categories))
        .route("/categories/:id", get(get_category))
        .route("/import", post(import_file))
        .route("/import/json", post(import_json))
        .route("/recommendations", post(recommend))
        .route("/campaigns/export", post(export_campaign))
        .route("/configs", get(list_configs))
        .route("/configs/:name", get(get_config))
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr).await?;
    info!("Server listening on http://{}", settings.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct CategoriesResponse<T> {
    success: bool,
    categories: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    orphans: Option<Vec<CategoryRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<Warning>>,
}

impl<T> CategoriesResponse<T> {
    fn ok(categories: Vec<T>) -> Self {
        Self {
            success: true,
            categories,
            orphans: None,
            warnings: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct CategoryResponse {
    success: bool,
    category: CategoryNode,
    path: Vec<String>,
}

#[derive(Serialize)]
struct SearchHit {
    #[serde(flatten)]
    record: CategoryRecord,
    path: Vec<String>,
}

#[derive(Serialize)]
struct RecommendationsResponse {
    success: bool,
    recommendations: Vec<Recommendation>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint.
async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct TypeQuery {
    #[serde(rename = "type")]
    category_type: Option<String>,
}

/// Flat list of category records.
async fn list_categories(
    State(state): State<AppState>,
    Query(query): Query<TypeQuery>,
) -> Result<Json<CategoriesResponse<CategoryRecord>>, ApiError> {
    let records = load_records(&state, query.category_type.as_deref()).await?;
    Ok(Json(CategoriesResponse::ok(records)))
}

#[derive(Deserialize)]
struct HierarchyQuery {
    #[serde(rename = "type")]
    category_type: Option<String>,
    #[serde(default)]
    diagnostics: bool,
}

/// Full category forest, rebuilt on every request.
async fn get_hierarchy(
    State(state): State<AppState>,
    Query(query): Query<HierarchyQuery>,
) -> Result<Json<CategoriesResponse<CategoryNode>>, ApiError> {
    let records = load_records(&state, query.category_type.as_deref()).await?;
    let built = build_logged(&records);

    let mut response = CategoriesResponse::ok(built.forest);
    if query.diagnostics {
        response.orphans = Some(built.orphans);
        response.warnings = Some(built.warnings);
    }
    Ok(Json(response))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(rename = "type")]
    category_type: Option<String>,
    limit: Option<usize>,
}

/// Case-insensitive name search with breadcrumb paths.
async fn search_categories(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<CategoriesResponse<SearchHit>>, ApiError> {
    let records = load_records(&state, query.category_type.as_deref()).await?;
    let paths = hierarchy::index_paths(&hierarchy::build(&records).forest);
    let hits = search_records(&records, &paths, &query.q, query.limit.unwrap_or(50));
    Ok(Json(CategoriesResponse::ok(hits)))
}

/// A single category with its subtree.
///
/// Unknown ids are answered from a point lookup; only stored ids pay for the
/// full scan and rebuild.
async fn get_category(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CategoryResponse>, ApiError> {
    let stored = state.store.get(&id).await.map_err(|e| {
        error!("Failed to look up category {}: {:#}", id, e);
        (StatusCode::BAD_GATEWAY, format!("Category store error: {}", e))
    })?;
    if stored.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Unknown category: {}", id)));
    }

    let records = load_records(&state, None).await?;
    let built = hierarchy::build(&records);

    let (node, path) = hierarchy::locate(&built.forest, &id).ok_or((
        StatusCode::NOT_FOUND,
        format!("Category {} is orphaned and not part of the hierarchy", id),
    ))?;

    Ok(Json(CategoryResponse {
        success: true,
        category: node.clone(),
        path,
    }))
}

#[derive(Deserialize)]
struct ImportQuery {
    #[serde(default)]
    dry_run: bool,
}

/// Upload a category file (.json, .csv, .xlsx) and upsert its records.
async fn import_file(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    mut multipart: Multipart,
) -> Result<Json<ImportReport>, ApiError> {
    let mut filename = String::new();
    let mut file_data = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        if field.name() == Some("file") {
            filename = field.file_name().unwrap_or("categories.json").to_string();
            file_data = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, format!("Failed to read file: {}", e)))?
                .to_vec();
            break;
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No file uploaded".to_string()));
    }

    info!("Received import file: {} ({} bytes)", filename, file_data.len());

    let records = importer::parse_file(&filename, &file_data)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{:#}", e)))?;
    run_import(&state, records, query.dry_run).await
}

/// Import a JSON body (flat array or nested tree).
async fn import_json(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ImportReport>, ApiError> {
    let records =
        importer::parse_json(&body).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    run_import(&state, records, query.dry_run).await
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendRequest {
    brief: String,
    #[serde(default)]
    category_type: Option<String>,
    #[serde(default)]
    max_results: Option<usize>,
    #[serde(default)]
    config: Option<String>,
}

/// Ask the LLM for categories matching a campaign brief.
async fn recommend(
    State(state): State<AppState>,
    Json(request): Json<RecommendRequest>,
) -> Result<Json<RecommendationsResponse>, ApiError> {
    let recommender = state.recommender.clone().ok_or((
        StatusCode::SERVICE_UNAVAILABLE,
        "Recommendations are not configured (OPENROUTER_API_KEY missing)".to_string(),
    ))?;

    if request.brief.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "brief must not be empty".to_string()));
    }

    let config: &RecommenderConfig = state.configs.resolve(request.config.as_deref()).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!(
                "Unknown config: {:?}. Available: {:?}",
                request.config,
                state.configs.list()
            ),
        )
    })?;

    let records = load_records(&state, request.category_type.as_deref()).await?;
    let paths = hierarchy::index_paths(&build_logged(&records).forest);
    // Orphans are not offered as candidates.
    let candidates: Vec<CategoryRecord> = records
        .into_iter()
        .filter(|r| paths.contains_key(&r.id))
        .collect();

    let recommendations = recommender
        .recommend(&request.brief, &candidates, &paths, config, request.max_results)
        .await
        .map_err(|e| {
            error!("Recommendation failed: {:#}", e);
            (StatusCode::BAD_GATEWAY, format!("Recommendation failed: {}", e))
        })?;

    Ok(Json(RecommendationsResponse {
        success: true,
        recommendations,
    }))
}

/// Assemble a campaign configuration from selected category ids.
async fn export_campaign(
    State(state): State<AppState>,
    Json(request): Json<CampaignRequest>,
) -> Result<Json<CampaignConfig>, ApiError> {
    if request.name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "name must not be empty".to_string()));
    }

    let records = load_records(&state, None).await?;
    let paths = hierarchy::index_paths(&hierarchy::build(&records).forest);
    let campaign = campaign::build_campaign(&request, &records, &paths);

    if !campaign.unknown_ids.is_empty() {
        warn!(
            "Campaign '{}' references unknown categories: {:?}",
            campaign.name, campaign.unknown_ids
        );
    }
    info!(
        "Exported campaign {} with {} categories",
        campaign.id,
        campaign.targeting.len()
    );
    Ok(Json(campaign))
}

/// List available recommender configs.
async fn list_configs(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.configs.list())
}

/// Get a specific recommender config.
async fn get_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RecommenderConfig>, StatusCode> {
    state
        .configs
        .get(&name)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// ============================================================================
// Helper functions
// ============================================================================

/// Fetch all records, optionally restricted to one category type.
async fn load_records(
    state: &AppState,
    category_type: Option<&str>,
) -> Result<Vec<CategoryRecord>, ApiError> {
    let filter = match category_type {
        None => None,
        Some(raw) => Some(CategoryType::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                format!("Unknown category type: {} (demographics|interests|behaviors)", raw),
            )
        })?),
    };

    let records = state.store.list_all().await.map_err(|e| {
        error!("Failed to list categories: {:#}", e);
        (StatusCode::BAD_GATEWAY, format!("Category store error: {}", e))
    })?;

    Ok(filter_by_type(records, filter))
}

fn filter_by_type(records: Vec<CategoryRecord>, filter: Option<CategoryType>) -> Vec<CategoryRecord> {
    match filter {
        None => records,
        Some(t) => records
            .into_iter()
            .filter(|r| r.category_type == Some(t))
            .collect(),
    }
}

/// Build the forest and report data-quality corrections to the log.
fn build_logged(records: &[CategoryRecord]) -> BuildResult {
    let built = hierarchy::build(records);
    if !built.warnings.is_empty() {
        warn!(
            "Hierarchy built with {} warnings, {} orphans ({} roots, {} nodes)",
            built.warnings.len(),
            built.orphans.len(),
            built.forest.len(),
            built.node_count()
        );
        for w in &built.warnings {
            debug!("{:?} on '{}': {}", w.code, w.id, w.detail);
        }
    }
    built
}

async fn run_import(
    state: &AppState,
    records: Vec<CategoryRecord>,
    dry_run: bool,
) -> Result<Json<ImportReport>, ApiError> {
    importer::import_records(state.store.as_ref(), records, dry_run)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Import failed: {:#}", e);
            (StatusCode::BAD_GATEWAY, format!("Import failed: {}", e))
        })
}

fn search_records(
    records: &[CategoryRecord],
    paths: &HashMap<String, Vec<String>>,
    query: &str,
    limit: usize,
) -> Vec<SearchHit> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<SearchHit> = records
        .iter()
        .filter(|r| r.name.to_lowercase().contains(&needle))
        .map(|r| SearchHit {
            record: r.clone(),
            path: paths
                .get(&r.id)
                .cloned()
                .unwrap_or_else(|| vec![r.name.clone()]),
        })
        .collect();

    hits.sort_by(|a, b| {
        a.record
            .level
            .cmp(&b.record.level)
            .then_with(|| a.record.name.cmp(&b.record.name))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    hits.truncate(limit);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records() -> Vec<CategoryRecord> {
        vec![
            CategoryRecord::new("int", None, 1)
                .with_name("Interests")
                .with_type(CategoryType::Interests),
            CategoryRecord::new("int-yoga", Some("int"), 2)
                .with_name("Yoga")
                .with_type(CategoryType::Interests),
            CategoryRecord::new("int-hot-yoga", Some("int-yoga"), 3)
                .with_name("Hot yoga")
                .with_type(CategoryType::Interests),
            CategoryRecord::new("beh", None, 1)
                .with_name("Behaviors")
                .with_type(CategoryType::Behaviors),
        ]
    }

    #[test]
    fn test_search_records() {
        let records = records();
        let paths = hierarchy::index_paths(&hierarchy::build(&records).forest);

        let hits = search_records(&records, &paths, "YOGA", 10);
        let ids: Vec<&str> = hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["int-yoga", "int-hot-yoga"]);
        assert_eq!(hits[1].path, vec!["Interests", "Yoga", "Hot yoga"]);

        assert_eq!(search_records(&records, &paths, "yoga", 1).len(), 1);
        assert!(search_records(&records, &paths, "  ", 10).is_empty());
    }

    #[test]
    fn test_filter_by_type() {
        let filtered = filter_by_type(records(), Some(CategoryType::Behaviors));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "beh");
        assert_eq!(filter_by_type(records(), None).len(), 4);
    }

    async fn state_with(records: &[CategoryRecord]) -> AppState {
        let store = MemoryCategoryStore::new();
        store.upsert_batch(records).await.unwrap();
        AppState {
            store: Arc::new(store),
            recommender: None,
            configs: Arc::new(ConfigStore::load_or_default(std::path::Path::new("/nonexistent"))),
        }
    }

    #[tokio::test]
    async fn test_get_category() {
        let mut all = records();
        all.push(CategoryRecord::new("lost", Some("gone"), 2));
        let state = state_with(&all).await;

        let Json(found) = get_category(State(state.clone()), Path("int-yoga".to_string()))
            .await
            .unwrap();
        assert_eq!(found.category.id(), "int-yoga");
        assert_eq!(found.category.children[0].id(), "int-hot-yoga");
        assert_eq!(found.path, vec!["Interests", "Yoga"]);

        let (status, _) = get_category(State(state.clone()), Path("ghost".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, message) = get_category(State(state), Path("lost".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(message.contains("orphaned"));
    }

    #[tokio::test]
    async fn test_hierarchy_response_shape() {
        let state = state_with(&records()).await;

        let Json(response) = get_hierarchy(
            State(state),
            Query(HierarchyQuery {
                category_type: Some("interests".to_string()),
                diagnostics: false,
            }),
        )
        .await
        .unwrap();

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["categories"][0]["id"], "int");
        assert_eq!(value["categories"][0]["children"][0]["children"][0]["id"], "int-hot-yoga");
        assert!(value.get("warnings").is_none());
    }
}
