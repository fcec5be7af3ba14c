use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub file_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file_name: "wherry.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Long sweep that enqueues every active account at low priority.
    pub discovery_interval_secs: u64,
    /// Short cycle that drains the queue through the worker pool.
    pub dispatch_interval_secs: u64,
    pub worker_count: usize,
    pub dispatch_batch_size: usize,
    pub max_new_per_run: usize,
    pub page_size: usize,
    pub max_pages_per_run: usize,
    /// Minimum spacing between outbound provider calls, shared by all workers.
    pub provider_min_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: 4 * 60 * 60,
            dispatch_interval_secs: 60,
            worker_count: 4,
            dispatch_batch_size: 8,
            max_new_per_run: 500,
            page_size: 50,
            max_pages_per_run: 10,
            provider_min_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub scopes: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://mail.googleapis.com/mail/v1".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            client_id: String::new(),
            scopes: vec!["https://mail.google.com/".to_string()],
        }
    }
}
