//! Server settings and recommender configuration.
//!
//! Settings come from the environment (`.env` is loaded first). Recommender
//! configs are JSON files in `CONFIG_DIR`; when none are found the built-in
//! default is used.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::category_store::StoreKind;

/// Process-level settings read once at startup.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub store: StoreKind,
    pub seed_file: Option<PathBuf>,
    pub config_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self> {
        let store = match std::env::var("CATEGORY_STORE") {
            Ok(raw) => StoreKind::parse(&raw)
                .with_context(|| format!("Unknown CATEGORY_STORE '{}' (memory|supabase)", raw))?,
            Err(_) => StoreKind::Memory,
        };

        let max_upload_mb: usize = match std::env::var("MAX_UPLOAD_MB") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("MAX_UPLOAD_MB must be a number, got '{}'", raw))?,
            Err(_) => 20,
        };

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            store,
            seed_file: std::env::var("SEED_FILE").ok().map(PathBuf::from),
            config_dir: std::env::var("CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("configs")),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
        })
    }
}

/// Prompt and ranking settings for one recommendation flavour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommenderConfig {
    pub name: String,
    pub description: String,
    pub prompts: Prompts,
    /// Upper bound on returned suggestions when the request gives none.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Suggestions scored below this are dropped.
    #[serde(default)]
    pub min_relevance: f64,
    /// Model override for this config (OpenRouter model id).
    #[serde(default)]
    pub model: Option<String>,
}

fn default_max_results() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompts {
    /// System prompt; the candidate category list is appended to it.
    pub system: String,
    /// Instructions placed after the campaign brief in the user message.
    pub instructions: String,
}

/// All loaded recommender configs.
#[derive(Debug)]
pub struct ConfigStore {
    configs: HashMap<String, RecommenderConfig>,
    default_config: String,
}

impl ConfigStore {
    /// Load all configs from the specified directory.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut configs = HashMap::new();

        if !dir.exists() {
            anyhow::bail!("Config directory does not exist: {:?}", dir);
        }

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config: {:?}", path))?;

                let config: RecommenderConfig = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config: {:?}", path))?;

                info!("Loaded config: {} from {:?}", config.name, path);
                configs.insert(config.name.clone(), config);
            }
        }

        if configs.is_empty() {
            anyhow::bail!("No configs found in {:?}", dir);
        }

        Ok(Self::from_map(configs))
    }

    /// Load from `dir`, falling back to the built-in default config.
    pub fn load_or_default(dir: &Path) -> Self {
        match Self::load_from_dir(dir) {
            Ok(store) => store,
            Err(e) => {
                warn!("Using built-in recommender config: {:#}", e);
                Self::from_map(HashMap::from([(
                    "default".to_string(),
                    create_default_config(),
                )]))
            }
        }
    }

    fn from_map(configs: HashMap<String, RecommenderConfig>) -> Self {
        let default_config = if configs.contains_key("default") {
            "default".to_string()
        } else {
            let mut names: Vec<&String> = configs.keys().collect();
            names.sort();
            names.first().map(|n| n.to_string()).unwrap_or_default()
        };

        Self {
            configs,
            default_config,
        }
    }

    pub fn get(&self, name: &str) -> Option<&RecommenderConfig> {
        self.configs.get(name)
    }

    /// Resolve an optional requested name to a config.
    pub fn resolve(&self, name: Option<&str>) -> Option<&RecommenderConfig> {
        self.get(name.unwrap_or(&self.default_config))
    }

    /// List all available config names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Built-in recommender config used when `CONFIG_DIR` has none.
pub fn create_default_config() -> RecommenderConfig {
    RecommenderConfig {
        name: "default".to_string(),
        description: "Meta Ads detailed-targeting suggestions".to_string(),
        prompts: Prompts {
            system: r#"You are a paid-social strategist who selects Meta Ads detailed-targeting categories.
You may ONLY choose categories from the list below. Each line is:
id | type | path | audience size"#
                .to_string(),
            instructions: r#"Pick the categories from the list that best match the campaign above.
Return ONLY valid JSON with this structure:

{
  "recommendations": [
    {"id": "category id from the list", "relevance": 0.0-1.0, "justification": "one sentence"}
  ]
}"#
            .to_string(),
        },
        max_results: default_max_results(),
        min_relevance: 0.0,
        model: None,
    }
}
