//! Canonical audit event types.
//!
//! These strings are written to the `audit_events.event_type` column and
//! published on the live bus. They are queried by callers, so renaming one is
//! a breaking change. Keep this list grouped by entity.

// Changesets
pub const CHANGESET_PROPOSED: &str = "changeset_proposed";
pub const CHANGESET_DEDUPLICATED: &str = "changeset_deduplicated";
pub const CHANGESET_DENIED: &str = "changeset_denied";
pub const CHANGESET_SUPERSEDED: &str = "changeset_superseded";
pub const CHANGESET_APPROVED: &str = "changeset_approved";
pub const CHANGESET_REJECTED: &str = "changeset_rejected";
pub const CHANGESET_CLAIMED: &str = "changeset_claimed";
pub const CHANGESET_APPLIED: &str = "changeset_applied";
pub const CHANGESET_RETRY_SCHEDULED: &str = "changeset_retry_scheduled";
pub const CHANGESET_DEAD_LETTERED: &str = "changeset_dead_lettered";

// Agent runs
pub const AGENT_RUN_PROPOSED: &str = "agent_run_proposed";
pub const AGENT_RUN_DEDUPLICATED: &str = "agent_run_deduplicated";
pub const AGENT_RUN_DENIED: &str = "agent_run_denied";
pub const AGENT_RUN_APPROVED: &str = "agent_run_approved";
pub const AGENT_RUN_REJECTED: &str = "agent_run_rejected";
pub const AGENT_RUN_CLAIMED: &str = "agent_run_claimed";
pub const AGENT_RUN_STARTED: &str = "agent_run_started";
pub const AGENT_RUN_COMPLETED: &str = "agent_run_completed";
pub const AGENT_RUN_FAILED: &str = "agent_run_failed";
pub const AGENT_RUN_RETRY_SCHEDULED: &str = "agent_run_retry_scheduled";
pub const AGENT_RUN_CANCELLED: &str = "agent_run_cancelled";
pub const AGENT_RUN_LEASE_EXPIRED: &str = "agent_run_lease_expired";

// Shared
pub const RETRY_BUDGET_EXHAUSTED: &str = "retry_budget_exhausted";
pub const TRANSITION_REJECTED: &str = "transition_rejected";
pub const INTERNAL_ERROR: &str = "internal_error";
