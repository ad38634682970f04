use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens_per_request: u32,
    /// Wall-clock bound on a single generation call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// S3-compatible endpoint, e.g. "https://s3.rbx.io.cloud.ovh.net"
    pub endpoint_url: String,
    pub region: String,
    /// Supports ${ENV_VAR} substitution. Only the broker ever sees these.
    pub access_key: String,
    /// Supports ${ENV_VAR} substitution
    pub secret_key: String,
    #[serde(default = "default_grant_ttl")]
    pub grant_ttl_secs: u64,
    /// Hard cap; over-long ttl requests are clamped, not rejected
    #[serde(default = "default_max_grant_ttl")]
    pub max_grant_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_exec_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Maximum generate → validate cycles before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Extra module symbols allowed on top of the builtin table
    #[serde(default)]
    pub allow_extra: Vec<String>,
    /// Extra module symbols denied on top of the builtin table
    #[serde(default)]
    pub deny_extra: Vec<String>,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    120
}

fn default_grant_ttl() -> u64 {
    3600
}

fn default_max_grant_ttl() -> u64 {
    86_400
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_exec_timeout() -> u64 {
    300
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./data/jobs")
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache/scripts")
}

fn default_cache_ttl() -> i64 {
    30 * 24 * 3600
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            timeout_secs: default_exec_timeout(),
            work_dir: default_work_dir(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${ANTHROPIC_API_KEY}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [llm]
        provider = "anthropic"
        model = "claude-sonnet-4-5-20250929"
        api_key = "test-key"

        [storage]
        endpoint_url = "https://s3.example.net"
        region = "rbx"
        access_key = "AK"
        secret_key = "SK"
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();
        assert_eq!(config.execution.interpreter, "python3");
        assert_eq!(config.execution.timeout_secs, 300);
        assert_eq!(config.cache.ttl_secs, 30 * 24 * 3600);
        assert_eq!(config.gateway.max_attempts, 3);
        assert_eq!(config.storage.grant_ttl_secs, 3600);
        assert_eq!(config.storage.max_grant_ttl_secs, 86_400);
        assert!(config.policy.allow_extra.is_empty());
        assert!(config.policy.deny_extra.is_empty());
    }

    #[test]
    fn test_explicit_sections_override_defaults() {
        let toml_str = format!(
            "{MINIMAL}\n\
             [execution]\n\
             interpreter = \"python3.12\"\n\
             timeout_secs = 60\n\
             [gateway]\n\
             max_attempts = 5\n\
             [policy]\n\
             deny_extra = [\"yaml\"]\n"
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.execution.interpreter, "python3.12");
        assert_eq!(config.execution.timeout_secs, 60);
        assert_eq!(config.gateway.max_attempts, 5);
        assert_eq!(config.policy.deny_extra, vec!["yaml".to_string()]);
    }
}
