//! Fleet models - shared types for the reconciliation cycle
//!
//! Snapshots are built fresh every cycle and never mutated afterwards.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

//=============================================================================
// MEMBERS
//=============================================================================

/// Provider-side state of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Pending,
    Active,
    Error,
    Absent,
}

/// Independent liveness verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    Alive,
    Dead,
    /// The oracle could not be reached this cycle
    Unknown,
}

/// One worker instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub instance_id: String,
    pub ordinal: u32,
    pub internal_address: Option<IpAddr>,
    pub provider_state: ProviderState,
    pub liveness: LivenessState,
    pub attached_volume_id: Option<String>,
}

impl Member {
    pub fn is_active(&self) -> bool {
        self.provider_state == ProviderState::Active
    }

    /// Provider reports it running and the oracle reports it alive
    pub fn is_operational(&self) -> bool {
        self.is_active() && self.liveness == LivenessState::Alive
    }

    /// Present at the provider but explicitly reported dead
    pub fn is_unhealthy(&self) -> bool {
        self.is_active() && self.liveness == LivenessState::Dead
    }

    /// Lower is better when two records share a name
    fn record_rank(&self) -> (u8, u8) {
        let state = match self.provider_state {
            ProviderState::Active => 0,
            ProviderState::Pending => 1,
            ProviderState::Error => 2,
            ProviderState::Absent => 3,
        };
        let liveness = match self.liveness {
            LivenessState::Alive => 0,
            LivenessState::Unknown => 1,
            LivenessState::Dead => 2,
        };
        (state, liveness)
    }
}

/// Ordinal encoded in a member name, 0 when the name does not parse
pub fn parse_ordinal(prefix: &str, name: &str) -> u32 {
    name.strip_prefix(prefix)
        .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
        .unwrap_or(0)
}

pub fn member_name(prefix: &str, ordinal: u32) -> String {
    format!("{}{}", prefix, ordinal)
}

//=============================================================================
// SNAPSHOT
//=============================================================================

/// Everything the decider sees for one cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub prefix: String,
    /// Sorted by ordinal, then name; names are unique
    pub members: Vec<Member>,
    pub desired_count: usize,
    /// Whether the oracle answered this cycle
    pub liveness_known: bool,
}

impl FleetSnapshot {
    /// Build a snapshot, enforcing its invariants: one member per name,
    /// ordinal order, addresses only on active members.
    ///
    /// When names collide the most useful record wins: active over pending
    /// over error over absent, then alive over unknown over dead.
    pub fn new(prefix: impl Into<String>, members: Vec<Member>, desired_count: usize, liveness_known: bool) -> Self {
        let mut members: Vec<Member> = members
            .into_iter()
            .map(|mut m| {
                if !m.is_active() {
                    m.internal_address = None;
                }
                m
            })
            .collect();

        members.sort_by(|a, b| {
            a.ordinal
                .cmp(&b.ordinal)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.record_rank().cmp(&b.record_rank()))
        });
        members.dedup_by(|later, earlier| later.name == earlier.name);

        Self {
            prefix: prefix.into(),
            members,
            desired_count,
            liveness_known,
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn operational_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_operational()).count()
    }

    /// Highest ordinal in use across every provider state
    pub fn max_ordinal(&self) -> u32 {
        self.members.iter().map(|m| m.ordinal).max().unwrap_or(0)
    }
}

//=============================================================================
// ACTIONS
//=============================================================================

/// A step toward the desired state; data only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Action {
    /// Destroy an active-but-dead member and create one under a new ordinal
    ReplaceUnhealthy {
        member: Member,
        replacement_ordinal: u32,
    },
    /// Create `count` members with ordinals `first_ordinal..`
    ScaleUp { count: usize, first_ordinal: u32 },
    /// Destroy surplus members, newest first
    ScaleDown { members: Vec<Member> },
}

impl Action {
    pub fn new_ordinals(&self) -> Vec<u32> {
        match self {
            Self::ReplaceUnhealthy { replacement_ordinal, .. } => vec![*replacement_ordinal],
            Self::ScaleUp { count, first_ordinal } => {
                let count = u32::try_from(*count).unwrap_or(u32::MAX);
                (0..count).map(|i| first_ordinal.saturating_add(i)).collect()
            }
            Self::ScaleDown { .. } => vec![],
        }
    }

    pub fn targets(&self) -> Vec<&Member> {
        match self {
            Self::ReplaceUnhealthy { member, .. } => vec![member],
            Self::ScaleUp { .. } => vec![],
            Self::ScaleDown { members } => members.iter().collect(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplaceUnhealthy { member, replacement_ordinal } => {
                write!(f, "replace {} (new ordinal {})", member.name, replacement_ordinal)
            }
            Self::ScaleUp { count, first_ordinal } => {
                write!(f, "scale up by {} from ordinal {}", count, first_ordinal)
            }
            Self::ScaleDown { members } => {
                let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
                write!(f, "scale down {}", names.join(", "))
            }
        }
    }
}
