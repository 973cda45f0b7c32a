//! Fleet CLI - one-shot commands for operators
//!
//! Everything here is read-only; only `run` changes the fleet.

use clap::Subcommand;
use std::fmt::Write;

use super::models::*;
use super::{CycleError, Steward};
use crate::edge::{render_inventory, EdgeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum FleetCommands {
    /// Run the reconciliation loop (default)
    Run,

    /// Observe and decide once, print the actions, execute nothing
    Plan,

    /// Print the current fleet snapshot
    Status,

    /// Render the edge inventory from a fresh provider query
    Inventory,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Edge(#[from] EdgeError),

    #[error("'{0:?}' is not a one-shot command")]
    NotOneShot(FleetCommands),
}

/// Execute a one-shot command and return what to print
pub async fn execute_command(steward: &Steward, cmd: FleetCommands) -> Result<String, CommandError> {
    match cmd {
        FleetCommands::Plan => {
            let (snapshot, actions) = steward.plan().await?;
            Ok(format_plan(&snapshot, &actions))
        }
        FleetCommands::Status => {
            let (snapshot, _) = steward.plan().await?;
            Ok(format_snapshot(&snapshot))
        }
        FleetCommands::Inventory => {
            let edge = steward.edge();
            let topology = edge.topology().await?;
            Ok(render_inventory(&topology, &edge.settings().host_access()))
        }
        FleetCommands::Run => Err(CommandError::NotOneShot(cmd)),
    }
}

pub fn format_snapshot(snapshot: &FleetSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Fleet '{}': {} desired, {} active, {} operational{}",
        snapshot.prefix,
        snapshot.desired_count,
        snapshot.active_count(),
        snapshot.operational_count(),
        if snapshot.liveness_known { "" } else { " (health oracle unreachable)" }
    );

    if snapshot.members.is_empty() {
        out.push_str("  (no members)\n");
        return out;
    }

    let _ = writeln!(out, "  {:<16} {:<16} {:<8} {}", "NAME", "ADDRESS", "STATE", "LIVENESS");
    for m in &snapshot.members {
        let address = m
            .internal_address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {:<16} {:<16} {:<8} {}",
            m.name,
            address,
            format!("{:?}", m.provider_state).to_lowercase(),
            format!("{:?}", m.liveness).to_lowercase()
        );
    }
    out
}

pub fn format_plan(snapshot: &FleetSnapshot, actions: &[Action]) -> String {
    let mut out = format_snapshot(snapshot);
    out.push('\n');

    if actions.is_empty() {
        out.push_str("Nothing to do.\n");
        return out;
    }

    let _ = writeln!(out, "Planned actions:");
    for (i, action) in actions.iter().enumerate() {
        let _ = writeln!(out, "  {}. {}", i + 1, action);
    }
    out
}
