use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;
use std::collections::BTreeMap;
use tollgate_core::ProposeAgentRun;
use tollgate_protocol::{Budgets, ReasonCode, RunStatus};

use super::util::{actor_context, open_engine, print_json, GlobalArgs};

#[derive(Subcommand)]
pub enum RunCmd {
    /// Propose an agent run for review
    Propose(ProposeArgs),
    /// Approve a proposed run, or re-approve a failed one
    Approve(IdArgs),
    /// Reject a proposed run
    Reject(RejectArgs),
    /// Cancel a run that has not finished
    Cancel(IdArgs),
    /// Lease approved runs to a worker
    Claim(ClaimArgs),
    /// Execute a run leased to a worker
    Execute(ExecuteArgs),
    /// Print one run
    Show(IdArgs),
    /// List runs
    List(ListArgs),
}

#[derive(Args)]
pub struct ProposeArgs {
    /// What the agent should accomplish
    #[arg(long)]
    goal: String,
    #[arg(long)]
    model: String,
    /// Repository the run works against (`owner/name`)
    #[arg(long)]
    repo: Option<String>,
    /// Registered executor name
    #[arg(long, default_value = "provider_stub")]
    adapter: String,
    /// Token ceiling; configured ceiling when omitted
    #[arg(long)]
    max_total_tokens: Option<u64>,
    /// Tool-call ceiling; configured ceiling when omitted
    #[arg(long)]
    max_tool_calls: Option<u32>,
    /// Wall-clock ceiling in seconds; configured ceiling when omitted
    #[arg(long)]
    max_wall_seconds: Option<u64>,
    /// Tool the agent may use (repeatable)
    #[arg(long = "tool")]
    tools: Vec<String>,
    /// Environment entry `KEY=VALUE` (repeatable); credentials are refused
    #[arg(long = "env", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
    #[arg(long)]
    idempotency_key: Option<String>,
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(Args)]
pub struct IdArgs {
    /// Run id
    run_id: String,
}

#[derive(Args)]
pub struct RejectArgs {
    /// Run id
    run_id: String,
    /// Reason code recorded with the rejection
    #[arg(long, value_parser = parse_reason)]
    reason: Option<ReasonCode>,
}

#[derive(Args)]
pub struct ClaimArgs {
    #[arg(long, default_value = "cli")]
    worker: String,
    #[arg(long, default_value_t = 1)]
    limit: u32,
    /// Lease length in seconds; configured default when omitted
    #[arg(long)]
    lease_seconds: Option<u64>,
}

#[derive(Args)]
pub struct ExecuteArgs {
    /// Run id
    run_id: String,
    /// Worker identity that holds the lease
    #[arg(long, default_value = "cli")]
    worker: String,
}

#[derive(Args)]
pub struct ListArgs {
    #[arg(long, value_parser = parse_status)]
    status: Option<RunStatus>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u64,
}

fn parse_status(raw: &str) -> Result<RunStatus, String> {
    RunStatus::from_slug(raw).ok_or_else(|| format!("unknown run status {raw:?}"))
}

fn parse_reason(raw: &str) -> Result<ReasonCode, String> {
    ReasonCode::from_slug(raw).ok_or_else(|| format!("unknown reason code {raw:?}"))
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

pub async fn execute(global: &GlobalArgs, cmd: RunCmd) -> Result<()> {
    let engine = open_engine(global)?;
    match cmd {
        RunCmd::Propose(args) => {
            let ceilings = engine.config().budgets.as_budgets();
            let budgets = Budgets {
                max_total_tokens: args.max_total_tokens.unwrap_or(ceilings.max_total_tokens),
                max_tool_calls: args.max_tool_calls.unwrap_or(ceilings.max_tool_calls),
                max_wall_seconds: args.max_wall_seconds.unwrap_or(ceilings.max_wall_seconds),
            };
            let spec = ProposeAgentRun {
                goal: args.goal,
                model: args.model,
                repo: args.repo,
                budgets,
                tools_allowed: args.tools,
                adapter_name: args.adapter,
                env: args.env.into_iter().collect::<BTreeMap<_, _>>(),
                idempotency_key: args.idempotency_key,
                max_retries: args.max_retries,
            };
            let proposal = engine.propose_agent_run(spec, &actor_context(global)).await?;
            print_json(
                &json!({
                    "run": proposal.entity,
                    "deduplicated": proposal.deduplicated,
                    "superseded": proposal.superseded,
                }),
                global.pretty,
            )
        }
        RunCmd::Approve(args) => {
            let row = engine
                .approve_agent_run(&args.run_id, &actor_context(global))
                .await?;
            print_json(&row, global.pretty)
        }
        RunCmd::Reject(args) => {
            let row = engine
                .reject_agent_run(&args.run_id, &global.actor, args.reason)
                .await?;
            print_json(&row, global.pretty)
        }
        RunCmd::Cancel(args) => {
            let row = engine.cancel_agent_run(&args.run_id, &global.actor).await?;
            print_json(&row, global.pretty)
        }
        RunCmd::Claim(args) => {
            let lease = args
                .lease_seconds
                .unwrap_or(engine.config().leases.default_lease_seconds);
            let rows = engine
                .claim_agent_runs(&args.worker, args.limit, lease)
                .await?;
            print_json(&rows, global.pretty)
        }
        RunCmd::Execute(args) => {
            let row = engine.execute_agent_run(&args.run_id, &args.worker).await?;
            print_json(&row, global.pretty)
        }
        RunCmd::Show(args) => {
            let row = engine.get_agent_run(&args.run_id).await?;
            print_json(&row, global.pretty)
        }
        RunCmd::List(args) => {
            let page = engine
                .list_agent_runs(args.status, args.limit, args.offset)
                .await?;
            print_json(&page, global.pretty)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_split_on_the_first_equals() {
        assert_eq!(
            parse_env_pair("QUERY=a=b").expect("pair"),
            ("QUERY".to_string(), "a=b".to_string())
        );
        assert!(parse_env_pair("NOVALUE").is_err());
        assert!(parse_env_pair("=x").is_err());
    }
}
