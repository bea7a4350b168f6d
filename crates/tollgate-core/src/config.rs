use anyhow::{Context as _, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tollgate_policy::PolicyConfig;
use tollgate_protocol::Budgets;
use tollgate_runtime::AdapterKind;

pub const ENV_CONFIG: &str = "TOLLGATE_CONFIG";
pub const ENV_STATE_DIR: &str = "TOLLGATE_STATE_DIR";
pub const ENV_POLICY_POSTURE: &str = "TOLLGATE_POLICY_POSTURE";
pub const ENV_WRITE_TOKEN: &str = "TOLLGATE_WRITE_TOKEN";

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct StorageConfig {
    /// Directory holding the SQLite database. Defaults to `./.tollgate`.
    #[serde(default)]
    pub state_dir: Option<String>,
}

impl StorageConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".tollgate"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retries allowed after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct LeaseConfig {
    #[serde(default = "default_lease_seconds")]
    pub default_lease_seconds: u64,
    /// Changesets in `applying` at once per repo.
    #[serde(default)]
    pub max_claims_per_repo: Option<u32>,
    /// Agent runs holding a live lease at once per adapter.
    #[serde(default)]
    pub max_running_per_adapter: Option<u32>,
    /// Longest lease a claim may request.
    #[serde(default = "default_max_lease_seconds")]
    pub max_lease_seconds: u64,
}

fn default_lease_seconds() -> u64 {
    300
}
fn default_max_lease_seconds() -> u64 {
    86_400
}

impl LeaseConfig {
    /// Whether a claim may request `lease_seconds`.
    pub fn admits(&self, lease_seconds: u64) -> bool {
        lease_seconds > 0 && lease_seconds <= self.max_lease_seconds
    }

    pub fn validate(&self) -> Result<()> {
        if !self.admits(self.default_lease_seconds) {
            anyhow::bail!(
                "[leases].default_lease_seconds must be between 1 and max_lease_seconds ({}), got {}",
                self.max_lease_seconds,
                self.default_lease_seconds
            );
        }
        Ok(())
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lease_seconds: default_lease_seconds(),
            max_claims_per_repo: None,
            max_running_per_adapter: None,
            max_lease_seconds: default_max_lease_seconds(),
        }
    }
}

/// Upper bounds any agent-run proposal must stay within.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct BudgetCeilings {
    #[serde(default = "default_max_total_tokens")]
    pub max_total_tokens: u64,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: u32,
    #[serde(default = "default_max_wall_seconds")]
    pub max_wall_seconds: u64,
}

fn default_max_total_tokens() -> u64 {
    200_000
}
fn default_max_tool_calls() -> u32 {
    200
}
fn default_max_wall_seconds() -> u64 {
    3_600
}

impl Default for BudgetCeilings {
    fn default() -> Self {
        Self {
            max_total_tokens: default_max_total_tokens(),
            max_tool_calls: default_max_tool_calls(),
            max_wall_seconds: default_max_wall_seconds(),
        }
    }
}

impl BudgetCeilings {
    pub fn as_budgets(&self) -> Budgets {
        Budgets {
            max_total_tokens: self.max_total_tokens,
            max_tool_calls: self.max_tool_calls,
            max_wall_seconds: self.max_wall_seconds,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct AdaptersConfig {
    /// Executor used to apply approved changesets.
    #[serde(default = "default_changeset_adapter")]
    pub changeset_adapter: String,
    /// Built-in executors to register: `manual`, `provider_stub`.
    #[serde(default = "default_enabled_adapters")]
    pub enabled: Vec<String>,
    /// Delay between polls of an in-flight job.
    #[serde(default = "default_adapter_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_changeset_adapter() -> String {
    "manual".into()
}
fn default_enabled_adapters() -> Vec<String> {
    AdapterKind::ALL.iter().map(|k| k.as_str().to_string()).collect()
}
fn default_adapter_poll_ms() -> u64 {
    500
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            changeset_adapter: default_changeset_adapter(),
            enabled: default_enabled_adapters(),
            poll_interval_ms: default_adapter_poll_ms(),
        }
    }
}

impl AdaptersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Enabled built-in kinds. Unknown names are an error, not a silent skip.
    pub fn kinds(&self) -> Result<Vec<AdapterKind>> {
        self.enabled
            .iter()
            .map(|name| {
                AdapterKind::from_slug(name)
                    .ok_or_else(|| anyhow::anyhow!("unknown adapter {name:?} in [adapters].enabled"))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct WorkerConfig {
    /// Idle sleep between loop iterations that found no work.
    #[serde(default = "default_worker_poll_ms")]
    pub poll_interval_ms: u64,
    /// Items claimed per kind per iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_worker_poll_ms() -> u64 {
    1_000
}
fn default_batch_size() -> u32 {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_worker_poll_ms(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub leases: LeaseConfig,
    #[serde(default)]
    pub budgets: BudgetCeilings,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

static CONFIG_SCHEMA_JSON: Lazy<serde_json::Value> = Lazy::new(|| {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_value(&schema).expect("schema json")
});

static CONFIG_SCHEMA: Lazy<Validator> =
    Lazy::new(|| validator_for(&CONFIG_SCHEMA_JSON).expect("valid schema"));

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics on first use if schema generation fails; this indicates a
/// programming error.
pub fn config_schema_json() -> serde_json::Value {
    CONFIG_SCHEMA_JSON.clone()
}

/// Parse and validate TOML text. Every schema violation is reported, not
/// just the first.
pub fn parse_config(content: &str) -> Result<OrchestratorConfig> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: OrchestratorConfig = toml::from_str(content)?;
    cfg.leases.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

/// Load from `TOLLGATE_CONFIG` when set (defaults otherwise) and apply
/// environment overrides.
pub fn load_from_env() -> Result<OrchestratorConfig> {
    let mut cfg = match std::env::var(ENV_CONFIG) {
        Ok(path) if !path.trim().is_empty() => load_config(Path::new(&path))?,
        _ => OrchestratorConfig::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

pub fn apply_env_overrides(cfg: &mut OrchestratorConfig) {
    if let Some(dir) = env_nonempty(ENV_STATE_DIR) {
        cfg.storage.state_dir = Some(dir);
    }
    if let Some(posture) = env_nonempty(ENV_POLICY_POSTURE) {
        cfg.policy.posture = posture;
    }
}

/// Whether a write credential is available to the changeset executor. Only
/// presence is observed; the value never enters the engine.
pub fn write_token_present() -> bool {
    env_nonempty(ENV_WRITE_TOKEN).is_some()
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = parse_config("").expect("empty config");
        assert_eq!(cfg.retry.base_delay_ms, 100);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.leases.default_lease_seconds, 300);
        assert_eq!(cfg.adapters.changeset_adapter, "manual");
        assert_eq!(cfg.policy.posture, "standard");
        assert_eq!(cfg.adapters.kinds().expect("kinds").len(), 2);
    }

    #[test]
    fn sections_parse_and_override_presets() {
        let cfg = parse_config(
            r#"
            [policy]
            posture = "relaxed"
            repo_allowlist = ["org/*"]

            [retry]
            max_retries = 2

            [leases]
            max_claims_per_repo = 1
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.leases.max_claims_per_repo, Some(1));
        assert_eq!(cfg.policy.rules().repo_allowlist, vec!["org/*".to_string()]);
    }

    #[test]
    fn schema_violations_are_collected() {
        let err = parse_config(
            r#"
            [retry]
            max_retries = "many"
            base_delay_ms = -5
            "#,
        )
        .expect_err("invalid types");
        let msg = err.to_string();
        assert!(msg.contains("many"), "{msg}");
        assert!(msg.contains("-5"), "{msg}");
    }

    #[test]
    fn lease_bounds_are_enforced() {
        let cfg = parse_config("").expect("empty config");
        assert_eq!(cfg.leases.max_lease_seconds, 86_400);
        assert!(cfg.leases.admits(1));
        assert!(cfg.leases.admits(86_400));
        assert!(!cfg.leases.admits(0));
        assert!(!cfg.leases.admits(86_401));
        assert!(!cfg.leases.admits(u64::MAX));

        let err = parse_config("[leases]\ndefault_lease_seconds = 0\n").expect_err("zero lease");
        assert!(err.to_string().contains("default_lease_seconds"), "{err}");
        let err = parse_config("[leases]\ndefault_lease_seconds = 600\nmax_lease_seconds = 60\n")
            .expect_err("default above max");
        assert!(err.to_string().contains("600"), "{err}");
    }

    #[test]
    fn unknown_adapter_name_is_rejected() {
        let cfg = parse_config("[adapters]\nenabled = [\"telepathy\"]\n").expect("parse");
        assert!(cfg.adapters.kinds().is_err());
    }

    #[test]
    fn schema_json_names_sections() {
        let schema = config_schema_json();
        let props = &schema["properties"];
        for section in ["storage", "policy", "retry", "leases", "budgets", "adapters", "worker"] {
            assert!(props.get(section).is_some(), "missing {section}");
        }
        assert_eq!(schema, config_schema_json());
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        std::env::set_var(ENV_STATE_DIR, "/tmp/tollgate-test-state");
        std::env::set_var(ENV_POLICY_POSTURE, "strict");
        let mut cfg = OrchestratorConfig::default();
        apply_env_overrides(&mut cfg);
        std::env::remove_var(ENV_STATE_DIR);
        std::env::remove_var(ENV_POLICY_POSTURE);
        assert_eq!(cfg.storage.state_dir(), PathBuf::from("/tmp/tollgate-test-state"));
        assert_eq!(cfg.policy.posture, "strict");
    }

    #[test]
    #[serial]
    fn write_token_presence_ignores_blank_values() {
        std::env::set_var(ENV_WRITE_TOKEN, "  ");
        assert!(!write_token_present());
        std::env::set_var(ENV_WRITE_TOKEN, "ghp_x");
        assert!(write_token_present());
        std::env::remove_var(ENV_WRITE_TOKEN);
    }
}
