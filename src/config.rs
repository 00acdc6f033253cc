use anyhow::{anyhow, Result};

#[derive(Debug, Clone)]
pub(crate) struct AppConfig {
    pub(crate) database: DatabaseConfig,
    pub(crate) redis: RedisConfig,
    pub(crate) api: ApiConfig,
    pub(crate) app: RuntimeConfig,
}

#[derive(Debug, Clone)]
pub(crate) struct DatabaseConfig {
    pub(crate) url: String,
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) max_lifetime_seconds: u64,
    pub(crate) acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct RedisConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) password: String,
    pub(crate) db: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) simulator_enabled: bool,
    pub(crate) simulator_interval_seconds: u64,
    pub(crate) max_search_results: i64,
    pub(crate) stream_max_len: usize,
}

impl RedisConfig {
    pub(crate) fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

pub(crate) fn load_config() -> Result<AppConfig> {
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 5),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 50),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        redis: RedisConfig {
            host: env_string("REDIS_HOST", "localhost"),
            port: env_u16("REDIS_PORT", 6379),
            password: env_string("REDIS_PASSWORD", ""),
            db: env_i64("REDIS_DB", 0),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("PORT", 8080),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        app: RuntimeConfig {
            simulator_enabled: env_bool("SIMULATOR_ENABLED", true),
            simulator_interval_seconds: env_u64("SIMULATOR_INTERVAL_SECONDS", 3).max(1),
            max_search_results: env_i64("MAX_SEARCH_RESULTS", 100).clamp(1, 200),
            stream_max_len: env_usize("STREAM_MAX_LEN", 100),
        },
    };
    if cfg.app.stream_max_len == 0 {
        return Err(anyhow!("STREAM_MAX_LEN must be > 0"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => parse_list_value(&v)
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect()),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_list_value(raw: &str) -> Option<Vec<String>> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
        return Some(v.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    let parts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_without_password() {
        let cfg = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
        };
        assert_eq!(cfg.url(), "redis://localhost:6379/0");
    }

    #[test]
    fn redis_url_with_password_and_db() {
        let cfg = RedisConfig {
            host: "redis.internal".to_string(),
            port: 6380,
            password: "hunter2".to_string(),
            db: 3,
        };
        assert_eq!(cfg.url(), "redis://:hunter2@redis.internal:6380/3");
    }

    #[test]
    fn list_values_parse_from_json_or_csv() {
        assert_eq!(
            parse_list_value(r#"["http://a", "http://b"]"#),
            Some(vec!["http://a".to_string(), "http://b".to_string()])
        );
        assert_eq!(
            parse_list_value("http://a, http://b"),
            Some(vec!["http://a".to_string(), "http://b".to_string()])
        );
        assert_eq!(parse_list_value(""), None);
    }
}
