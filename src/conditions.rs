use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::resources::awsmachinepools::{
    AwsMachinePoolCondition, ConditionSeverity, ConditionStatus,
};

pub const READY: &str = "Ready";
pub const ASG_READY: &str = "ASGReady";
pub const LAUNCH_TEMPLATE_READY: &str = "LaunchTemplateReady";
pub const INSTANCE_REFRESH_STARTED: &str = "InstanceRefreshStarted";
pub const MACHINES_SYNCED: &str = "MachinesSynced";

/// Conditions that must all be True for the pool to be Ready, in reporting order.
pub const READY_CONSTITUENTS: [&str; 2] = [ASG_READY, LAUNCH_TEMPLATE_READY];

pub mod reasons {
    pub const WAITING_FOR_CLUSTER_INFRASTRUCTURE: &str = "WaitingForClusterInfrastructure";
    pub const WAITING_FOR_BOOTSTRAP_DATA: &str = "WaitingForBootstrapData";
    pub const ASG_PROVISIONING: &str = "ASGProvisioning";
    pub const ASG_PROVISION_FAILED: &str = "ASGProvisionFailed";
    pub const ASG_DELETION_IN_PROGRESS: &str = "ASGDeletionInProgress";
    pub const LAUNCH_TEMPLATE_NOT_FOUND: &str = "LaunchTemplateNotFound";
    pub const LAUNCH_TEMPLATE_CREATE_FAILED: &str = "LaunchTemplateCreateFailed";
    pub const LAUNCH_TEMPLATE_RECONCILE_FAILED: &str = "LaunchTemplateReconcileFailed";
    pub const INSTANCE_REFRESH_NOT_READY: &str = "InstanceRefreshNotReady";
    pub const MACHINES_SYNC_FAILED: &str = "MachinesSyncFailed";
    pub const INVALID_SPEC: &str = "InvalidSpec";
}

/// The conditions of a single pool, mutated in place during a reconcile pass and written
/// back with the rest of the status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Conditions {
    conditions: Vec<AwsMachinePoolCondition>,
}

impl Conditions {
    pub fn new(existing: Option<&Vec<AwsMachinePoolCondition>>) -> Self {
        Self {
            conditions: existing.cloned().unwrap_or_default(),
        }
    }

    pub fn into_vec(self) -> Vec<AwsMachinePoolCondition> {
        self.conditions
    }

    pub fn get(&self, type_: &str) -> Option<&AwsMachinePoolCondition> {
        self.conditions.iter().find(|c| c.r#type == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn mark_true(&mut self, type_: &str) {
        self.set(AwsMachinePoolCondition {
            r#type: type_.into(),
            status: ConditionStatus::True,
            ..Default::default()
        })
    }

    pub fn mark_false(
        &mut self,
        type_: &str,
        reason: &str,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) {
        let message = message.into();
        self.set(AwsMachinePoolCondition {
            r#type: type_.into(),
            status: ConditionStatus::False,
            reason: Some(reason.into()),
            severity: Some(severity),
            message: (!message.is_empty()).then_some(message),
            last_transition_time: None,
        })
    }

    pub fn mark_unknown(&mut self, type_: &str, reason: &str, message: impl Into<String>) {
        let message = message.into();
        self.set(AwsMachinePoolCondition {
            r#type: type_.into(),
            status: ConditionStatus::Unknown,
            reason: Some(reason.into()),
            message: (!message.is_empty()).then_some(message),
            ..Default::default()
        })
    }

    fn set(&mut self, mut condition: AwsMachinePoolCondition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) => {
                // only update the transition time if the status changed
                condition.last_transition_time = if existing.status == condition.status {
                    existing.last_transition_time.clone()
                } else {
                    Some(Time(Utc::now()))
                };
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(Time(Utc::now()));
                self.conditions.push(condition);
            }
        }
    }

    /// Derives `type_` from `constituents`: True when they all are, otherwise a copy of the
    /// least ready one. When every unready constituent is only waiting (False with Info
    /// severity) the message reports progress instead.
    pub fn set_summary(&mut self, type_: &str, constituents: &[&str]) {
        let states: Vec<AwsMachinePoolCondition> = constituents
            .iter()
            .map(|t| {
                self.get(t).cloned().unwrap_or_else(|| AwsMachinePoolCondition {
                    r#type: t.to_string(),
                    ..Default::default()
                })
            })
            .collect();

        let Some(worst) = states
            .iter()
            .filter(|c| c.status != ConditionStatus::True)
            .min_by_key(|c| readiness_rank(c))
            .cloned()
        else {
            self.mark_true(type_);
            return;
        };

        let all_waiting = states
            .iter()
            .filter(|c| c.status != ConditionStatus::True)
            .all(|c| readiness_rank(c) == WAITING);

        let message = if all_waiting {
            let completed = states
                .iter()
                .filter(|c| c.status == ConditionStatus::True)
                .count();
            Some(format!("{completed} of {} completed", states.len()))
        } else {
            worst.message.clone()
        };

        let reason = worst.reason.as_deref().unwrap_or_default();
        match worst.status {
            ConditionStatus::False => self.mark_false(
                type_,
                reason,
                worst.severity.unwrap_or(ConditionSeverity::Info),
                message.unwrap_or_default(),
            ),
            _ => self.mark_unknown(type_, reason, message.unwrap_or_default()),
        }
    }
}

const WAITING: u8 = 2;

/// Lower is less ready.
fn readiness_rank(condition: &AwsMachinePoolCondition) -> u8 {
    match (condition.status, condition.severity) {
        (ConditionStatus::False, Some(ConditionSeverity::Error)) => 0,
        (ConditionStatus::False, Some(ConditionSeverity::Warning)) => 1,
        (ConditionStatus::False, _) => WAITING,
        (ConditionStatus::Unknown, _) => 3,
        (ConditionStatus::True, _) => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let then = Time(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let mut conditions = Conditions::new(Some(&vec![AwsMachinePoolCondition {
            r#type: ASG_READY.into(),
            status: ConditionStatus::False,
            reason: Some(reasons::ASG_PROVISIONING.into()),
            severity: Some(ConditionSeverity::Info),
            last_transition_time: Some(then.clone()),
            message: None,
        }]));

        conditions.mark_false(
            ASG_READY,
            reasons::ASG_PROVISION_FAILED,
            ConditionSeverity::Error,
            "quota exceeded",
        );
        let cond = conditions.get(ASG_READY).unwrap();
        assert_eq!(cond.last_transition_time, Some(then.clone()));
        assert_eq!(cond.reason.as_deref(), Some(reasons::ASG_PROVISION_FAILED));
        assert_eq!(cond.message.as_deref(), Some("quota exceeded"));

        conditions.mark_true(ASG_READY);
        let cond = conditions.get(ASG_READY).unwrap();
        assert_ne!(cond.last_transition_time, Some(then));
        assert_eq!(cond.reason, None);
        assert_eq!(cond.severity, None);
    }

    #[test]
    fn summary_is_true_when_all_constituents_are() {
        let mut conditions = Conditions::default();
        conditions.mark_true(ASG_READY);
        conditions.mark_true(LAUNCH_TEMPLATE_READY);
        conditions.set_summary(READY, &READY_CONSTITUENTS);

        assert!(conditions.is_true(READY));
    }

    #[test]
    fn summary_picks_most_severe_constituent() {
        let mut conditions = Conditions::default();
        conditions.mark_false(
            ASG_READY,
            reasons::ASG_PROVISIONING,
            ConditionSeverity::Info,
            "",
        );
        conditions.mark_false(
            LAUNCH_TEMPLATE_READY,
            reasons::LAUNCH_TEMPLATE_CREATE_FAILED,
            ConditionSeverity::Error,
            "ami not found",
        );
        conditions.set_summary(READY, &READY_CONSTITUENTS);

        let ready = conditions.get(READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(
            ready.reason.as_deref(),
            Some(reasons::LAUNCH_TEMPLATE_CREATE_FAILED)
        );
        assert_eq!(ready.severity, Some(ConditionSeverity::Error));
        assert_eq!(ready.message.as_deref(), Some("ami not found"));
    }

    #[test]
    fn summary_counts_steps_while_waiting() {
        let mut conditions = Conditions::default();
        conditions.mark_true(LAUNCH_TEMPLATE_READY);
        conditions.mark_false(
            ASG_READY,
            reasons::ASG_PROVISIONING,
            ConditionSeverity::Info,
            "",
        );
        conditions.set_summary(READY, &READY_CONSTITUENTS);

        let ready = conditions.get(READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some(reasons::ASG_PROVISIONING));
        assert_eq!(ready.message.as_deref(), Some("1 of 2 completed"));
    }

    #[test]
    fn missing_constituents_are_unknown() {
        let mut conditions = Conditions::default();
        conditions.mark_true(ASG_READY);
        conditions.set_summary(READY, &READY_CONSTITUENTS);

        let ready = conditions.get(READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert!(!conditions.is_true(READY));
    }

    #[test]
    fn resetting_the_same_state_is_stable() {
        let mut conditions = Conditions::default();
        conditions.mark_false(
            ASG_READY,
            reasons::ASG_PROVISIONING,
            ConditionSeverity::Info,
            "",
        );
        conditions.set_summary(READY, &READY_CONSTITUENTS);
        let first = conditions.clone();

        conditions.mark_false(
            ASG_READY,
            reasons::ASG_PROVISIONING,
            ConditionSeverity::Info,
            "",
        );
        conditions.set_summary(READY, &READY_CONSTITUENTS);

        assert_eq!(first, conditions);
    }
}
