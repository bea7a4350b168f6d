//! Policy gate evaluated before any state transition that could lead to an
//! external write or a token-spending run.
//!
//! Evaluation is pure: the gate is built once from a [`PolicyConfig`] and
//! never reads ambient state afterwards. Overriding a list means building a
//! new gate.

use anyhow::{anyhow, Context as _, Result};
use cedar_policy::{
    Authorizer, Context, Entities, Entity as CedarEntity, EntityId, EntityTypeName, EntityUid,
    PolicySet, RestrictedExpression,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::str::FromStr;
use tollgate_protocol::{Operation, ReasonCode};

#[derive(Clone, Debug, Serialize, Deserialize, Default, JsonSchema)]
pub struct CedarConfig {
    /// Inline Cedar policy text. Combined with the built-in blanket permit,
    /// so only `forbid` rules change outcomes.
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub policy_path: Option<String>,
    /// Extra entities (Cedar JSON entity format), e.g. role membership.
    #[serde(default)]
    pub entities: Option<Value>,
    #[serde(default)]
    pub entities_path: Option<String>,
}

/// Policy section as written in configuration. Unset lists fall back to the
/// posture preset; a set list replaces the preset's list outright.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct PolicyConfig {
    /// `relaxed`, `standard` or `strict`.
    #[serde(default = "default_posture")]
    pub posture: String,
    /// Repo patterns: `org/repo`, `org/*` or `*`.
    #[serde(default)]
    pub repo_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub operation_denylist: Option<Vec<String>>,
    #[serde(default)]
    pub require_write_token: Option<bool>,
    #[serde(default)]
    pub cedar: Option<CedarConfig>,
}

fn default_posture() -> String {
    "standard".into()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            posture: default_posture(),
            repo_allowlist: None,
            operation_denylist: None,
            require_write_token: None,
            cedar: None,
        }
    }
}

/// Effective rules after applying overrides to the posture preset.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRules {
    pub repo_allowlist: Vec<String>,
    pub operation_denylist: Vec<String>,
    pub require_write_token: bool,
}

impl PolicyConfig {
    pub fn rules(&self) -> PolicyRules {
        let mut rules = posture_rules(&self.posture);
        if let Some(list) = &self.repo_allowlist {
            rules.repo_allowlist = list.clone();
        }
        if let Some(list) = &self.operation_denylist {
            rules.operation_denylist = list.clone();
        }
        if let Some(required) = self.require_write_token {
            rules.require_write_token = required;
        }
        rules
    }
}

/// Preset rules per posture. Unknown postures fall back to `standard`.
pub fn posture_rules(posture: &str) -> PolicyRules {
    match posture.trim().to_ascii_lowercase().as_str() {
        // Local experimentation: any repo, no token needed
        "relaxed" => PolicyRules {
            repo_allowlist: vec!["*".into()],
            operation_denylist: vec![],
            require_write_token: false,
        },
        // Hardened: no removals, explicit repos only
        "strict" => PolicyRules {
            repo_allowlist: vec![],
            operation_denylist: vec![
                Operation::RemoveLabels.as_str().into(),
                Operation::RemoveDependency.as_str().into(),
            ],
            require_write_token: true,
        },
        // Default: explicit repos only, writes need a token
        _ => PolicyRules {
            repo_allowlist: vec![],
            operation_denylist: vec![],
            require_write_token: true,
        },
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Human,
    Agent,
    Service,
}

impl ActorKind {
    fn cedar_type(&self) -> &'static str {
        match self {
            ActorKind::Human => "Human",
            ActorKind::Agent => "Agent",
            ActorKind::Service => "Service",
        }
    }
}

/// Who is asking, and what credentials back the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor: String,
    pub kind: ActorKind,
    /// A write credential is available to the executor for this request.
    #[serde(default)]
    pub has_write_token: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl ActorContext {
    pub fn human(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            kind: ActorKind::Human,
            has_write_token: false,
            roles: Vec::new(),
        }
    }

    pub fn with_write_token(mut self, present: bool) -> Self {
        self.has_write_token = present;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Denial {
    pub reason_code: ReasonCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub explain: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    fn deny(reason_code: ReasonCode, message: String) -> Self {
        Decision::Deny(Denial {
            reason_code,
            message,
            explain: Value::Null,
        })
    }
}

pub struct PolicyGate {
    cfg: PolicyConfig,
    rules: PolicyRules,
    cedar: Option<CedarEngine>,
}

impl fmt::Debug for PolicyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyGate")
            .field("rules", &self.rules)
            .field("cedar", &self.cedar.is_some())
            .finish()
    }
}

impl PolicyGate {
    /// Build a gate. Cedar sources that fail to load or parse are an error
    /// rather than a silently disabled layer.
    pub fn new(cfg: PolicyConfig) -> Result<Self> {
        let rules = cfg.rules();
        let cedar = match &cfg.cedar {
            Some(c) => Some(CedarEngine::from_config(c)?),
            None => None,
        };
        Ok(Self { cfg, rules, cedar })
    }

    pub fn rules(&self) -> &PolicyRules {
        &self.rules
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "posture": self.cfg.posture,
            "rules": self.rules,
            "cedar": self.cedar.is_some(),
        })
    }

    /// Decide whether `actor` may perform `operation` against `repo`.
    ///
    /// Checks run in a fixed order so the same inputs always produce the
    /// same reason code. `repo` is `None` for work not bound to a repository.
    pub fn evaluate(&self, operation: &str, repo: Option<&str>, actor: &ActorContext) -> Decision {
        let decision = self.evaluate_inner(operation, repo, actor);
        if let Decision::Deny(d) = &decision {
            tracing::debug!(
                target: "policy",
                operation,
                repo = repo.unwrap_or(""),
                actor = %actor.actor,
                reason = d.reason_code.as_str(),
                "denied"
            );
        }
        decision
    }

    fn evaluate_inner(&self, operation: &str, repo: Option<&str>, actor: &ActorContext) -> Decision {
        let Some(op) = Operation::from_slug(operation) else {
            return Decision::deny(
                ReasonCode::UnknownOperation,
                format!("operation {operation:?} is not recognised"),
            );
        };
        if actor.actor.trim().is_empty() {
            return Decision::deny(
                ReasonCode::AuthContextDenied,
                "request carries no actor".into(),
            );
        }
        if self
            .rules
            .operation_denylist
            .iter()
            .any(|d| d.trim().eq_ignore_ascii_case(op.as_str()))
        {
            return Decision::deny(
                ReasonCode::OperationDenylisted,
                format!("operation {op} is denylisted"),
            );
        }
        if let Some(repo) = repo {
            if !repo_allowed(&self.rules.repo_allowlist, repo) {
                return Decision::deny(
                    ReasonCode::RepoNotAllowlisted,
                    format!("repo {repo} is not on the allowlist"),
                );
            }
        }
        if op.is_mutating() && self.rules.require_write_token && !actor.has_write_token {
            return Decision::deny(
                ReasonCode::MissingWriteToken,
                format!("operation {op} requires a write token"),
            );
        }
        if let Some(engine) = &self.cedar {
            match engine.evaluate(op, repo, actor) {
                Ok((true, _)) => {}
                Ok((false, diagnostics)) => {
                    return Decision::Deny(Denial {
                        reason_code: ReasonCode::AuthContextDenied,
                        message: format!("{} may not {op}", actor.actor),
                        explain: diagnostics,
                    });
                }
                Err(err) => {
                    // Fail closed.
                    return Decision::Deny(Denial {
                        reason_code: ReasonCode::AuthContextDenied,
                        message: "authorization context could not be evaluated".into(),
                        explain: json!({ "cedar_error": err.to_string() }),
                    });
                }
            }
        }
        Decision::Allow
    }
}

/// Match `repo` against allowlist patterns. An empty list allows nothing.
pub fn repo_allowed(allowlist: &[String], repo: &str) -> bool {
    let repo = repo.trim().to_ascii_lowercase();
    if repo.is_empty() {
        return false;
    }
    allowlist.iter().any(|pattern| {
        let p = pattern.trim().to_ascii_lowercase();
        if p == "*" {
            return true;
        }
        match p.strip_suffix("/*") {
            Some(org) => repo
                .split_once('/')
                .map(|(o, _)| o == org)
                .unwrap_or(false),
            None => p == repo,
        }
    })
}

struct CedarEngine {
    authorizer: Authorizer,
    policies: PolicySet,
    base_entities: Option<Value>,
}

impl CedarEngine {
    fn from_config(cfg: &CedarConfig) -> Result<Self> {
        let extra = match (&cfg.policy_path, &cfg.policy) {
            (Some(path), _) => fs::read_to_string(path)
                .with_context(|| format!("reading cedar policy {path}"))?,
            (None, Some(src)) => src.clone(),
            (None, None) => String::new(),
        };
        let source = format!("{}\n{}", default_policy_source(), extra);
        let policies: PolicySet = source
            .parse()
            .map_err(|err| anyhow!("invalid cedar policy: {err}"))?;
        let base_entities = match (&cfg.entities_path, &cfg.entities) {
            (Some(path), _) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading cedar entities {path}"))?;
                Some(serde_json::from_str(&raw)?)
            }
            (None, entities) => entities.clone(),
        };
        Ok(Self {
            authorizer: Authorizer::new(),
            policies,
            base_entities,
        })
    }

    fn evaluate(
        &self,
        op: Operation,
        repo: Option<&str>,
        actor: &ActorContext,
    ) -> Result<(bool, Value)> {
        let principal_uid = make_uid(actor.kind.cedar_type(), &actor.actor)?;
        let action_uid = make_uid("Action", op.as_str())?;
        let resource_uid = make_uid("Repo", repo.unwrap_or("none"))?;

        let mut principal_attrs = HashMap::new();
        principal_attrs.insert(
            "roles".to_string(),
            RestrictedExpression::new_set(
                actor.roles.iter().cloned().map(RestrictedExpression::new_string),
            ),
        );
        let principal = CedarEntity::new(principal_uid.clone(), principal_attrs, HashSet::new())
            .map_err(|err| anyhow!("failed to build principal entity: {err}"))?;
        let resource = CedarEntity::new(resource_uid.clone(), HashMap::new(), HashSet::new())
            .map_err(|err| anyhow!("failed to build resource entity: {err}"))?;

        let mut entities = Entities::from_entities(vec![principal, resource], None)
            .map_err(|err| anyhow!("failed to assemble cedar entities: {err}"))?;
        if let Some(extra) = &self.base_entities {
            entities = entities
                .add_entities_from_json_value(extra.clone(), None)
                .map_err(|err| anyhow!("failed to merge cedar base entities: {err}"))?;
        }

        let context = Context::from_pairs(vec![
            (
                "operation".to_string(),
                RestrictedExpression::new_string(op.as_str().to_string()),
            ),
            (
                "category".to_string(),
                RestrictedExpression::new_string(op.category().as_str().to_string()),
            ),
            (
                "mutating".to_string(),
                RestrictedExpression::new_bool(op.is_mutating()),
            ),
            (
                "has_write_token".to_string(),
                RestrictedExpression::new_bool(actor.has_write_token),
            ),
        ])
        .map_err(|err| anyhow!("failed to construct cedar context: {err}"))?;

        let request =
            cedar_policy::Request::new(principal_uid, action_uid, resource_uid, context, None)
                .map_err(|err| anyhow!("failed to construct cedar request: {err}"))?;
        let response = self
            .authorizer
            .is_authorized(&request, &self.policies, &entities);
        let diagnostics = json!({
            "policies": response
                .diagnostics()
                .reason()
                .map(|id| id.to_string())
                .collect::<Vec<_>>(),
            "errors": response
                .diagnostics()
                .errors()
                .map(|err| err.to_string())
                .collect::<Vec<_>>(),
        });
        Ok((
            matches!(response.decision(), cedar_policy::Decision::Allow),
            diagnostics,
        ))
    }
}

fn make_uid(kind: &str, id: &str) -> Result<EntityUid> {
    let type_name = EntityTypeName::from_str(kind)
        .map_err(|err| anyhow!("invalid cedar entity type {kind}: {err}"))?;
    Ok(EntityUid::from_type_name_and_id(type_name, EntityId::new(id)))
}

fn default_policy_source() -> &'static str {
    "permit(principal, action, resource);"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(cfg: PolicyConfig) -> PolicyGate {
        PolicyGate::new(cfg).expect("gate")
    }

    fn writer() -> ActorContext {
        ActorContext::human("alice").with_write_token(true)
    }

    fn reason(d: Decision) -> Option<ReasonCode> {
        match d {
            Decision::Allow => None,
            Decision::Deny(d) => Some(d.reason_code),
        }
    }

    #[test]
    fn unknown_operations_are_denied_first() {
        let g = gate(PolicyConfig {
            posture: "relaxed".into(),
            ..Default::default()
        });
        assert_eq!(
            reason(g.evaluate("delete_repo", Some("org/repo"), &writer())),
            Some(ReasonCode::UnknownOperation)
        );
    }

    #[test]
    fn allowlist_override_replaces_preset() {
        let g = gate(PolicyConfig {
            posture: "relaxed".into(),
            repo_allowlist: Some(vec!["acme/*".into(), "org/repo".into()]),
            ..Default::default()
        });
        assert!(g.evaluate("create_issue", Some("acme/widgets"), &writer()).is_allowed());
        assert!(g.evaluate("create_issue", Some("ORG/Repo"), &writer()).is_allowed());
        assert_eq!(
            reason(g.evaluate("create_issue", Some("org/other"), &writer())),
            Some(ReasonCode::RepoNotAllowlisted)
        );
    }

    #[test]
    fn standard_posture_denies_by_default() {
        let g = gate(PolicyConfig::default());
        assert_eq!(
            reason(g.evaluate("add_labels", Some("org/repo"), &writer())),
            Some(ReasonCode::RepoNotAllowlisted)
        );
    }

    #[test]
    fn denylist_and_write_token_are_enforced() {
        let g = gate(PolicyConfig {
            posture: "strict".into(),
            repo_allowlist: Some(vec!["org/repo".into()]),
            ..Default::default()
        });
        assert_eq!(
            reason(g.evaluate("remove_labels", Some("org/repo"), &writer())),
            Some(ReasonCode::OperationDenylisted)
        );
        assert_eq!(
            reason(g.evaluate("add_labels", Some("org/repo"), &ActorContext::human("alice"))),
            Some(ReasonCode::MissingWriteToken)
        );
        // Agent-run proposals do not write to the system of record.
        assert!(g
            .evaluate("propose_agent_run", Some("org/repo"), &ActorContext::human("alice"))
            .is_allowed());
    }

    #[test]
    fn empty_actor_is_denied() {
        let g = gate(PolicyConfig {
            posture: "relaxed".into(),
            ..Default::default()
        });
        assert_eq!(
            reason(g.evaluate("create_issue", Some("org/repo"), &ActorContext::human("  "))),
            Some(ReasonCode::AuthContextDenied)
        );
    }

    #[test]
    fn cedar_forbid_rules_deny_with_auth_context() {
        let g = gate(PolicyConfig {
            posture: "relaxed".into(),
            cedar: Some(CedarConfig {
                policy: Some(
                    "forbid(principal, action, resource) when { principal is Agent && context.mutating };"
                        .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        });
        let agent = ActorContext {
            actor: "planner".into(),
            kind: ActorKind::Agent,
            has_write_token: true,
            roles: vec![],
        };
        assert_eq!(
            reason(g.evaluate("create_issue", Some("org/repo"), &agent)),
            Some(ReasonCode::AuthContextDenied)
        );
        assert!(g
            .evaluate("propose_agent_run", Some("org/repo"), &agent)
            .is_allowed());
        assert!(g.evaluate("create_issue", Some("org/repo"), &writer()).is_allowed());
    }

    #[test]
    fn invalid_cedar_source_fails_construction() {
        let err = PolicyGate::new(PolicyConfig {
            cedar: Some(CedarConfig {
                policy: Some("forbid(".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
