use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use tollgate_core::{config, EngineError, Orchestrator, OrchestratorConfig};
use tollgate_policy::{ActorContext, ActorKind};

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Config file (TOML); falls back to `TOLLGATE_CONFIG`, then defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Override the state directory holding the database
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
    /// Identity recorded on audit events
    #[arg(long, global = true, default_value = "cli")]
    pub actor: String,
    /// Kind of actor making the request
    #[arg(long, global = true, value_enum, default_value_t = ActorKindArg::Human)]
    pub actor_kind: ActorKindArg,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorKindArg {
    Human,
    Agent,
    Service,
}

impl From<ActorKindArg> for ActorKind {
    fn from(value: ActorKindArg) -> Self {
        match value {
            ActorKindArg::Human => ActorKind::Human,
            ActorKindArg::Agent => ActorKind::Agent,
            ActorKindArg::Service => ActorKind::Service,
        }
    }
}

/// Effective configuration: explicit file, else environment, with the
/// state-dir flag applied last.
pub(crate) fn load_config(global: &GlobalArgs) -> Result<OrchestratorConfig> {
    let mut cfg = match &global.config {
        Some(path) => {
            let mut cfg = config::load_config(path)?;
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        None => config::load_from_env()?,
    };
    if let Some(dir) = &global.state_dir {
        cfg.storage.state_dir = Some(dir.display().to_string());
    }
    Ok(cfg)
}

pub(crate) fn open_engine(global: &GlobalArgs) -> Result<Orchestrator> {
    let cfg = load_config(global)?;
    let dir = cfg.storage.state_dir();
    Orchestrator::from_config(cfg)
        .with_context(|| format!("opening state directory {}", dir.display()))
}

/// The caller as the policy gate sees it. Write-token presence comes from
/// the environment; the value itself is never read.
pub(crate) fn actor_context(global: &GlobalArgs) -> ActorContext {
    ActorContext {
        actor: global.actor.clone(),
        kind: global.actor_kind.into(),
        has_write_token: config::write_token_present(),
        roles: Vec::new(),
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

/// One-line error text, prefixed with the reason code for engine errors.
pub(crate) fn describe_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<EngineError>() {
        Some(engine) => format!("{}: {}", engine.reason_code(), engine),
        None => format!("{:#}", err),
    }
}

pub(crate) fn parse_json_arg(raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_protocol::ReasonCode;

    #[test]
    fn engine_errors_lead_with_their_reason_code() {
        let err: anyhow::Error = EngineError::NotFound {
            entity: "changeset",
            id: "cs-1".into(),
        }
        .into();
        assert_eq!(describe_error(&err), "not_found: changeset cs-1 not found");

        let err: anyhow::Error = EngineError::Denied {
            reason_code: ReasonCode::MissingWriteToken,
            message: "write token required".into(),
        }
        .into();
        assert!(describe_error(&err).starts_with("missing_write_token: "));
    }

    #[test]
    fn plain_errors_keep_their_context_chain() {
        let err = anyhow::anyhow!("disk full").context("writing state");
        assert_eq!(describe_error(&err), "writing state: disk full");
    }

    #[test]
    fn json_arguments_are_validated() {
        assert!(parse_json_arg(r#"{"title":"x"}"#).is_ok());
        assert!(parse_json_arg("{title").is_err());
    }
}
