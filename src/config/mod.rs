pub mod app_config;

// Re-export common types for convenience
pub use app_config::{
    ApiConfig, AppConfig, ClassifierConfig, DatabaseConfig, EmptyOverridePolicy, ExtractConfig,
    FieldIds, LoggingConfig, RetryConfig, TaxonomyConfig, UpdaterConfig, WarehouseConfig,
};
