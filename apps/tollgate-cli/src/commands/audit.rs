use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde_json::json;
use tollgate_core::replay_status;
use tollgate_kernel::AuditQuery;

use super::util::{open_engine, print_json, GlobalArgs};

#[derive(Args)]
pub struct AuditArgs {
    /// Events for one agent run
    #[arg(long)]
    run: Option<String>,
    /// Events for one changeset
    #[arg(long)]
    changeset: Option<String>,
    /// Event type, e.g. `changeset_applied`
    #[arg(long = "type")]
    event_type: Option<String>,
    #[arg(long)]
    repo: Option<String>,
    /// Events recorded by this actor
    #[arg(long = "by")]
    by: Option<String>,
    /// Inclusive lower bound (RFC 3339)
    #[arg(long)]
    since: Option<String>,
    /// Exclusive upper bound (RFC 3339)
    #[arg(long)]
    until: Option<String>,
    #[arg(long, default_value_t = 100)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u64,
    /// Also print the status the trail replays to
    #[arg(long)]
    replay: bool,
}

fn parse_ts(raw: Option<String>, flag: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .with_context(|| format!("{flag} expects an RFC 3339 timestamp, got {s:?}"))
    })
    .transpose()
}

pub async fn execute(global: &GlobalArgs, args: AuditArgs) -> Result<()> {
    let query = AuditQuery {
        run_id: args.run,
        changeset_id: args.changeset,
        event_type: args.event_type,
        repo: args.repo,
        actor: args.by,
        start: parse_ts(args.since, "--since")?,
        end: parse_ts(args.until, "--until")?,
        limit: args.limit,
        offset: args.offset,
    };
    let engine = open_engine(global)?;
    let events = engine.query_audit(query).await?;
    if args.replay {
        let status = replay_status(&events);
        return print_json(&json!({ "status": status, "events": events }), global.pretty);
    }
    print_json(&events, global.pretty)
}
