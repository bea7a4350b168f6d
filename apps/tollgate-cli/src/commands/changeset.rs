use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use serde_json::{json, Value as JsonValue};
use std::path::PathBuf;
use tollgate_core::ProposeChangeset;
use tollgate_protocol::ChangesetStatus;

use super::util::{actor_context, open_engine, parse_json_arg, print_json, GlobalArgs};

#[derive(Subcommand)]
pub enum ChangesetCmd {
    /// Propose an external mutation for review
    Propose(ProposeArgs),
    /// Approve a changeset, or every proposed member of a bundle
    Approve(ApproveArgs),
    /// Reject a proposed or approved changeset
    Reject(RejectArgs),
    /// Cancel a changeset that has not finished
    Cancel(IdArgs),
    /// Claim and apply one approved changeset
    Apply(ApplyArgs),
    /// Apply a bundle's members in category order
    ApplyBundle(ApplyBundleArgs),
    /// Print one changeset
    Show(IdArgs),
    /// List changesets
    List(ListArgs),
}

#[derive(Args)]
pub struct ProposeArgs {
    /// Operation slug, e.g. `create_issue`
    #[arg(long = "op")]
    operation: String,
    /// Target repository (`owner/name`)
    #[arg(long)]
    repo: String,
    /// Existing object the operation targets, e.g. an issue number
    #[arg(long)]
    binding: Option<String>,
    /// Operation payload as inline JSON
    #[arg(long, value_parser = parse_json_arg, conflicts_with = "payload_file")]
    payload: Option<JsonValue>,
    /// Read the payload from a JSON file
    #[arg(long)]
    payload_file: Option<PathBuf>,
    /// Explicit idempotency key; derived from the intent when omitted
    #[arg(long)]
    idempotency_key: Option<String>,
    /// Group this changeset with others applied together
    #[arg(long)]
    bundle: Option<String>,
    /// Override the configured retry budget
    #[arg(long)]
    max_retries: Option<u32>,
}

#[derive(Args)]
pub struct ApproveArgs {
    /// Changeset id
    #[arg(required_unless_present = "bundle")]
    id: Option<String>,
    /// Approve every proposed member of this bundle instead
    #[arg(long, conflicts_with = "id")]
    bundle: Option<String>,
}

#[derive(Args)]
pub struct RejectArgs {
    /// Changeset id
    id: String,
    /// Note recorded with the rejection
    #[arg(long)]
    note: Option<String>,
}

#[derive(Args)]
pub struct IdArgs {
    /// Changeset id
    id: String,
}

#[derive(Args)]
pub struct ApplyArgs {
    /// Worker identity holding the lease
    #[arg(long, default_value = "cli")]
    worker: String,
    /// Lease length in seconds; configured default when omitted
    #[arg(long)]
    lease_seconds: Option<u64>,
}

#[derive(Args)]
pub struct ApplyBundleArgs {
    /// Bundle id
    bundle: String,
    /// Worker identity holding the leases
    #[arg(long, default_value = "cli")]
    worker: String,
    /// Lease length in seconds; configured default when omitted
    #[arg(long)]
    lease_seconds: Option<u64>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Only changesets in this status
    #[arg(long, value_parser = parse_status)]
    status: Option<ChangesetStatus>,
    /// Only members of this bundle
    #[arg(long)]
    bundle: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u64,
}

fn parse_status(raw: &str) -> Result<ChangesetStatus, String> {
    ChangesetStatus::from_slug(raw).ok_or_else(|| format!("unknown changeset status {raw:?}"))
}

pub async fn execute(global: &GlobalArgs, cmd: ChangesetCmd) -> Result<()> {
    let engine = open_engine(global)?;
    let lease_default = engine.config().leases.default_lease_seconds;
    match cmd {
        ChangesetCmd::Propose(args) => {
            let payload = match (args.payload, args.payload_file) {
                (Some(v), _) => v,
                (None, Some(path)) => {
                    let text = std::fs::read_to_string(&path)?;
                    serde_json::from_str(&text)?
                }
                (None, None) => json!({}),
            };
            let req = ProposeChangeset {
                operation: args.operation,
                repo: args.repo,
                binding: args.binding,
                payload,
                idempotency_key: args.idempotency_key,
                bundle_id: args.bundle,
                max_retries: args.max_retries,
            };
            let proposal = engine.propose_changeset(req, &actor_context(global)).await?;
            print_json(
                &json!({
                    "changeset": proposal.entity,
                    "deduplicated": proposal.deduplicated,
                    "superseded": proposal.superseded,
                }),
                global.pretty,
            )
        }
        ChangesetCmd::Approve(args) => {
            let approver = actor_context(global);
            match (args.id, args.bundle) {
                (_, Some(bundle)) => {
                    let rows = engine.approve_bundle(&bundle, &approver).await?;
                    print_json(&rows, global.pretty)
                }
                (Some(id), None) => {
                    let row = engine.approve_changeset(&id, &approver).await?;
                    print_json(&row, global.pretty)
                }
                (None, None) => bail!("a changeset id or --bundle is required"),
            }
        }
        ChangesetCmd::Reject(args) => {
            let row = engine
                .reject_changeset(&args.id, &global.actor, args.note)
                .await?;
            print_json(&row, global.pretty)
        }
        ChangesetCmd::Cancel(args) => {
            let row = engine.cancel_changeset(&args.id, &global.actor).await?;
            print_json(&row, global.pretty)
        }
        ChangesetCmd::Apply(args) => {
            let lease = args.lease_seconds.unwrap_or(lease_default);
            let claimed = engine.claim_changesets(&args.worker, 1, lease).await?;
            let Some(next) = claimed.into_iter().next() else {
                return print_json(&json!({ "applied": JsonValue::Null }), global.pretty);
            };
            let row = engine.apply_changeset(&next.id, &args.worker).await?;
            print_json(&row, global.pretty)
        }
        ChangesetCmd::ApplyBundle(args) => {
            let lease = args.lease_seconds.unwrap_or(lease_default);
            let report = engine.apply_bundle(&args.bundle, &args.worker, lease).await?;
            print_json(&report, global.pretty)
        }
        ChangesetCmd::Show(args) => {
            let row = engine.get_changeset(&args.id).await?;
            print_json(&row, global.pretty)
        }
        ChangesetCmd::List(args) => {
            let page = engine
                .list_changesets(args.status, args.bundle, args.limit, args.offset)
                .await?;
            print_json(&page, global.pretty)
        }
    }
}
