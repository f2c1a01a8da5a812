//! Application-level configuration
//!
//! Defines the top-level configuration: remote API access, the analytics
//! warehouse, the classifier, batch sizing for extraction and updates, the
//! fixed taxonomy, and logging.

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Embedded default configuration file
const DEFAULT_CONFIG: &str = include_str!("../../unthread-sync.config.toml");

/// Configuration file name
const CONFIG_FILE_NAME: &str = "unthread-sync.config.toml";

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub taxonomy: TaxonomyConfig,
}

impl AppConfig {
    /// Load configuration from the usual locations, falling back to the
    /// embedded default (which is also written to the working directory).
    pub fn load() -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(CONFIG_FILE_NAME) {
            return Self::parse(&content, Path::new(CONFIG_FILE_NAME));
        }

        if let Some(base_dirs) = BaseDirs::new() {
            let home_config = base_dirs
                .home_dir()
                .join(".unthread-sync")
                .join(CONFIG_FILE_NAME);
            if let Ok(content) = std::fs::read_to_string(&home_config) {
                return Self::parse(&content, &home_config);
            }
        }

        if let Ok(config_path) = std::env::var("CONFIG_PATH") {
            if let Ok(content) = std::fs::read_to_string(&config_path) {
                return Self::parse(&content, Path::new(&config_path));
            }
        }

        eprintln!(
            "No configuration file found. Creating {} with default settings...",
            CONFIG_FILE_NAME
        );
        if let Err(e) = std::fs::write(CONFIG_FILE_NAME, DEFAULT_CONFIG) {
            eprintln!("Warning: Could not create {}: {}", CONFIG_FILE_NAME, e);
            eprintln!("Continuing with default configuration in memory.");
        }

        Self::embedded_default()
    }

    /// Load configuration from a specific file path.
    /// If the file doesn't exist, creates it with default settings.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create directory {}", parent.display()))?;
                }
                std::fs::write(path, DEFAULT_CONFIG)
                    .with_context(|| format!("Failed to create config file at {}", path.display()))?;
                eprintln!(
                    "Created {}. You can edit this file to customize your settings.",
                    path.display()
                );
                Self::embedded_default()
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            )),
        }
    }

    /// The configuration shipped inside the binary.
    pub fn embedded_default() -> Result<Self> {
        toml::from_str(DEFAULT_CONFIG)
            .map_err(|e| anyhow::anyhow!("Failed to parse embedded default config: {}", e))
    }

    fn parse(content: &str, origin: &Path) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", origin.display(), e))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level)),
        }

        let provider = self.classifier.provider.to_lowercase();
        if !["mock", "openai"].contains(&provider.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid classifier provider: {}",
                self.classifier.provider
            ));
        }
        if !(0.0..=2.0).contains(&self.classifier.temperature) {
            return Err(anyhow::anyhow!(
                "Temperature must be between 0.0 and 2.0, got {}",
                self.classifier.temperature
            ));
        }

        let sizes = [
            ("api.page_limit", self.api.page_limit),
            ("retry.max_attempts", self.retry.max_attempts),
            ("extract.max_workers", self.extract.max_workers),
            ("extract.batch_size", self.extract.batch_size),
            ("warehouse.batch_size", self.warehouse.batch_size),
            ("classifier.max_concurrency", self.classifier.max_concurrency),
            ("updater.batch_size", self.updater.batch_size),
            ("updater.max_in_flight", self.updater.max_in_flight),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(anyhow::anyhow!("{} must be greater than zero", name));
            }
        }

        for (name, id) in self.api.fields.named() {
            if id.trim().is_empty() {
                return Err(anyhow::anyhow!("Custom field id for {} cannot be empty", name));
            }
        }

        if self.taxonomy.categories.is_empty() {
            return Err(anyhow::anyhow!("Taxonomy must define at least one category"));
        }
        if self.taxonomy.resolutions.is_empty() {
            return Err(anyhow::anyhow!("Taxonomy must define at least one resolution"));
        }

        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    pub fn apply_env_overrides(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        if let Some(url) = var("UNTHREAD_API_URL") {
            self.api.base_url = url;
        }
        if let Some(path) = var("UNTHREAD_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(level) = var("UNTHREAD_LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(provider) = var("UNTHREAD_CLASSIFIER_PROVIDER") {
            self.classifier.provider = provider;
        }
        if let Some(model) = var("UNTHREAD_MODEL") {
            self.classifier.model = model;
        }
        if let Some(project) = var("BQ_PROJECT_ID") {
            self.warehouse.project_id = project;
        }
    }

    /// Get a summary of the configuration
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        summary.push_str("Configuration loaded:\n");
        summary.push_str(&format!("Database: {}\n", self.database.path.display()));
        summary.push_str(&format!("API: {}\n", self.api.base_url));
        summary.push_str(&format!(
            "Warehouse: {}\n",
            if self.warehouse.enabled {
                self.warehouse.table.as_str()
            } else {
                "disabled"
            }
        ));
        summary.push_str(&format!(
            "Classifier: {} ({})\n",
            self.classifier.provider, self.classifier.model
        ));
        summary.push_str(&format!(
            "Empty override policy: {:?}\n",
            self.classifier.empty_override_policy
        ));
        summary.push_str(&format!("Taxonomy categories: {}\n", self.taxonomy.categories.len()));
        summary.push_str(&format!("Logging Level: {}\n", self.logging.level));
        summary
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the DuckDB database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/unthread_data.duckdb"),
        }
    }
}

/// Ticketing API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fields: FieldIds,
}

fn default_api_key_env() -> String {
    "UNTHREAD_API_KEY".to_string()
}

fn default_page_limit() -> usize {
    200
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.unthread.io/api".to_string(),
            api_key_env: default_api_key_env(),
            page_limit: default_page_limit(),
            timeout_secs: default_timeout_secs(),
            fields: FieldIds::default(),
        }
    }
}

/// The four custom-field identifiers written back to each ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIds {
    pub category: String,
    pub sub_category: String,
    pub migration_category: String,
    pub resolution: String,
}

impl FieldIds {
    pub fn named(&self) -> [(&'static str, &str); 4] {
        [
            ("category", self.category.as_str()),
            ("sub_category", self.sub_category.as_str()),
            ("migration_category", self.migration_category.as_str()),
            ("resolution", self.resolution.as_str()),
        ]
    }
}

impl Default for FieldIds {
    fn default() -> Self {
        Self {
            category: "1a6900f6-36d2-4380-ad06-790b0b05c4b3".to_string(),
            sub_category: "05492140-551c-49ea-a8a2-4caeec8cda4d".to_string(),
            migration_category: "0598cba1-31d1-466e-bfd1-812548c73c51".to_string(),
            resolution: "5ccb3d90-fbaf-4eea-ac88-ef3a82705ab2".to_string(),
        }
    }
}

/// Retry policy for remote calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Extraction parallelism
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Ids per chunk, or days per date window
    #[serde(default = "default_extract_batch")]
    pub batch_size: usize,
}

fn default_max_workers() -> usize {
    4
}

fn default_extract_batch() -> usize {
    7
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_workers: default_max_workers(),
            batch_size: default_extract_batch(),
        }
    }
}

/// Read-only analytics warehouse (BigQuery)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,
    pub table: String,
    pub submitter_table: String,
    /// Upper bound on ids per IN-list
    #[serde(default = "default_warehouse_batch")]
    pub batch_size: usize,
}

fn default_access_token_env() -> String {
    "BQ_ACCESS_TOKEN".to_string()
}

fn default_warehouse_batch() -> usize {
    100
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            project_id: String::new(),
            access_token_env: default_access_token_env(),
            table: "dbt.stg_unthread__conversations".to_string(),
            submitter_table: "dbt.stg_unthread__users".to_string(),
            batch_size: default_warehouse_batch(),
        }
    }
}

/// How an empty-string custom field on the ticket is treated by tier 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmptyOverridePolicy {
    /// Empty strings fall through to the generative classifier.
    #[default]
    Absent,
    /// Empty strings count as an authoritative (blank) value.
    Present,
}

/// Generative classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Provider name ("openai" or "mock")
    pub provider: String,
    pub model: String,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub temperature: f32,
    /// Tier-3 calls allowed in flight at once
    #[serde(default = "default_classifier_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub empty_override_policy: EmptyOverridePolicy,
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_classifier_concurrency() -> usize {
    4
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: default_openai_key_env(),
            temperature: 0.0,
            max_concurrency: default_classifier_concurrency(),
            empty_override_policy: EmptyOverridePolicy::Absent,
        }
    }
}

/// Write-back batching and throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default = "default_update_batch")]
    pub batch_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Minimum spacing between remote requests
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

fn default_update_batch() -> usize {
    50
}

fn default_max_in_flight() -> usize {
    4
}

fn default_min_interval_ms() -> u64 {
    250
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_update_batch(),
            max_in_flight: default_max_in_flight(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Category → allowed sub-categories, plus the resolution labels.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaxonomyConfig {
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub resolutions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_default_is_valid() {
        let config = AppConfig::embedded_default().unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.warehouse.batch_size, 100);
        assert_eq!(config.updater.batch_size, 50);
        assert_eq!(
            config.api.fields.migration_category,
            "0598cba1-31d1-466e-bfd1-812548c73c51"
        );
        assert!(config.taxonomy.categories.contains_key("LangGraph"));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let mut config = AppConfig::embedded_default().unwrap();
        config.updater.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("updater.batch_size"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut config = AppConfig::embedded_default().unwrap();
        config.classifier.provider = "anthropic".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_override_policy_parses_lowercase() {
        let config: AppConfig = toml::from_str(
            r#"
[classifier]
provider = "mock"
model = "m"
empty_override_policy = "present"
"#,
        )
        .unwrap();
        assert_eq!(
            config.classifier.empty_override_policy,
            EmptyOverridePolicy::Present
        );
    }
}
