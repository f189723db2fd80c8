//! Status conditions
//!
//! Conditions are the externally observable proxy for reconciliation
//! progress. They are upserted by type, never appended, and the
//! `lastTransitionTime` only moves when the status actually flips.

use chrono::{DateTime, SubsecRound, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type for the summary `Ready` condition
pub const READY_CONDITION: &str = "Ready";
/// The platform endpoint is reachable with the configured credentials
pub const VCENTER_AVAILABLE_CONDITION: &str = "VCenterAvailable";
/// All adopted deployment zones are ready
pub const FAILURE_DOMAINS_AVAILABLE_CONDITION: &str = "FailureDomainsAvailable";
/// Cloud controller manager prerequisites are in place
pub const CCM_AVAILABLE_CONDITION: &str = "CCMAvailable";
/// CSI driver prerequisites are in place
pub const CSI_AVAILABLE_CONDITION: &str = "CSIAvailable";
/// The backing virtual machine exists and has network addresses
pub const VM_PROVISIONED_CONDITION: &str = "VMProvisioned";
/// Set by the Cluster API control plane provider on the owning `Cluster`
pub const CONTROL_PLANE_INITIALIZED_CONDITION: &str = "ControlPlaneInitialized";

/// Reason used while an object is being deleted
pub const DELETING_REASON: &str = "Deleting";
/// Reason used when the platform cannot be reached
pub const VCENTER_UNREACHABLE_REASON: &str = "VCenterUnreachable";
/// At least one adopted zone has not reported readiness yet
pub const WAITING_FOR_FAILURE_DOMAIN_STATUS_REASON: &str = "WaitingForFailureDomainStatus";
/// At least one adopted zone reported not ready
pub const FAILURE_DOMAINS_SKIPPED_REASON: &str = "FailureDomainsSkipped";
/// A network device has neither DHCP nor a static address yet
pub const WAITING_FOR_STATIC_IP_ALLOCATION_REASON: &str = "WaitingForStaticIPAllocation";
/// The lifecycle service failed to destroy the VM
pub const DELETION_FAILED_REASON: &str = "DeletionFailed";

/// Condition status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// Not determined yet
    #[default]
    Unknown,
}

/// Condition severity, only meaningful when the status is `False`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// Requires operator attention
    Error,
    /// Degraded but progressing
    Warning,
    /// Expected, transient state
    Info,
}

/// A single status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `VCenterAvailable`
    #[serde(rename = "type")]
    pub type_: String,

    /// Current status
    pub status: ConditionStatus,

    /// Severity of a `False` condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason in CamelCase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// A `True` condition of the given type
    pub fn true_condition(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: Some(now()),
        }
    }

    /// A `False` condition of the given type
    pub fn false_condition(
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason.to_string()),
            message: (!message.is_empty()).then_some(message),
            last_transition_time: Some(now()),
        }
    }

    /// Whether two conditions carry the same observable state, ignoring time
    fn same_state(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

// API server timestamps are second precision; keeping ours the same avoids
// a spurious diff after every round trip.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Objects whose status carries a condition list
pub trait HasConditions {
    /// Current conditions (empty when status is unset)
    fn conditions(&self) -> &[Condition];

    /// Mutable condition list, initialising status when needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

/// Look up a condition by type
pub fn get<'a, T: HasConditions + ?Sized>(obj: &'a T, type_: &str) -> Option<&'a Condition> {
    obj.conditions().iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type is `True`
pub fn is_true<T: HasConditions + ?Sized>(obj: &T, type_: &str) -> bool {
    get(obj, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Whether the condition of the given type is `False`
pub fn is_false<T: HasConditions + ?Sized>(obj: &T, type_: &str) -> bool {
    get(obj, type_).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Upsert a condition by type
///
/// If a condition of the same type exists with identical state it is left
/// untouched; if only the details changed the transition time is kept;
/// otherwise it is replaced wholesale.
pub fn set<T: HasConditions + ?Sized>(obj: &mut T, mut condition: Condition) {
    let conditions = obj.conditions_mut();
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => {}
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
    // Ready first, then alphabetical, so that equal sets serialise equally.
    conditions.sort_by(|a, b| {
        let rank = |c: &Condition| u8::from(c.type_ != READY_CONDITION);
        rank(a).cmp(&rank(b)).then_with(|| a.type_.cmp(&b.type_))
    });
}

/// Mark a condition `True`
pub fn mark_true<T: HasConditions + ?Sized>(obj: &mut T, type_: &str) {
    set(obj, Condition::true_condition(type_));
}

/// Mark a condition `False`
pub fn mark_false<T: HasConditions + ?Sized>(
    obj: &mut T,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set(obj, Condition::false_condition(type_, reason, severity, message));
}

/// Recompute the summary `Ready` condition from the given condition types
///
/// `Ready` is true when every listed condition is true. Otherwise it mirrors
/// the first listed condition that is false, falling back to the first one
/// that is missing.
pub fn set_summary<T: HasConditions + ?Sized>(obj: &mut T, from: &[&str]) {
    let failing = from
        .iter()
        .filter_map(|t| get(obj, t))
        .find(|c| c.status == ConditionStatus::False)
        .cloned();

    let summary = if let Some(c) = failing {
        Condition {
            type_: READY_CONDITION.to_string(),
            last_transition_time: Some(now()),
            ..c
        }
    } else if from.iter().all(|t| is_true(obj, t)) {
        Condition::true_condition(READY_CONDITION)
    } else {
        Condition {
            type_: READY_CONDITION.to_string(),
            status: ConditionStatus::Unknown,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: Some(now()),
        }
    };
    set(obj, summary);
}
