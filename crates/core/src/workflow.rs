//! Approval workflow for deviation cases.
//!
//! Stages sign off in a fixed order (`rd` → `quality` → `production` →
//! `general_manager`); the stored status always names the highest approved
//! stage, and `rejected` is a terminal override reachable from any
//! non-terminal state. Transitions that would skip a stage, re-approve a
//! stage, or mutate a terminal record are refused with typed errors instead
//! of being absorbed silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::actor::Actor;
use crate::domain::deviation::{Deviation, DeviationStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStage {
    Rd,
    Quality,
    Production,
    GeneralManager,
}

impl ApprovalStage {
    pub const ALL: [ApprovalStage; 4] =
        [Self::Rd, Self::Quality, Self::Production, Self::GeneralManager];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rd => "rd",
            Self::Quality => "quality",
            Self::Production => "production",
            Self::GeneralManager => "general_manager",
        }
    }

    /// Accepts the wire spelling (`generalManager`) as well as the storage
    /// spelling (`general_manager`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "rd" => Some(Self::Rd),
            "quality" => Some(Self::Quality),
            "production" => Some(Self::Production),
            "generalManager" | "general_manager" | "general-manager" => Some(Self::GeneralManager),
            _ => None,
        }
    }

    pub fn rank(&self) -> u8 {
        match self {
            Self::Rd => 0,
            Self::Quality => 1,
            Self::Production => 2,
            Self::GeneralManager => 3,
        }
    }

    /// The stage immediately below, which must already be signed off.
    pub fn predecessor(&self) -> Option<ApprovalStage> {
        match self {
            Self::Rd => None,
            Self::Quality => Some(Self::Rd),
            Self::Production => Some(Self::Quality),
            Self::GeneralManager => Some(Self::Production),
        }
    }

    pub fn approved_status(&self) -> DeviationStatus {
        match self {
            Self::Rd => DeviationStatus::RdApproved,
            Self::Quality => DeviationStatus::QualityApproved,
            Self::Production => DeviationStatus::ProductionApproved,
            Self::GeneralManager => DeviationStatus::FinalApproved,
        }
    }
}

impl std::fmt::Display for ApprovalStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("stage `{stage}` is already approved")]
    StageAlreadyApproved { stage: ApprovalStage },
    #[error("stage `{stage}` cannot be approved before stage `{awaiting}`")]
    OutOfOrderApproval { stage: ApprovalStage, awaiting: ApprovalStage },
    #[error("deviation is in terminal state `{status}` and accepts no further transitions")]
    TerminalState { status: DeviationStatus },
    #[error("a rejection reason is required")]
    EmptyRejectionReason,
}

impl Deviation {
    /// Sign off one stage. The record must not be terminal, the stage must
    /// not already be approved, and every lower stage must be approved first.
    /// Returns the status the record moved to.
    pub fn approve(
        &mut self,
        stage: ApprovalStage,
        actor: &Actor,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DeviationStatus, WorkflowError> {
        if self.status.is_terminal() {
            return Err(WorkflowError::TerminalState { status: self.status });
        }
        if self.stage(stage).approved {
            return Err(WorkflowError::StageAlreadyApproved { stage });
        }
        if let Some(awaiting) = stage.predecessor().filter(|prior| !self.stage(*prior).approved) {
            return Err(WorkflowError::OutOfOrderApproval { stage, awaiting });
        }

        let entry = self.stage_mut(stage);
        entry.approved = true;
        entry.approver = Some(actor.display_name().to_string());
        entry.approval_date = Some(now);
        entry.comments = comments;

        self.status = self.derived_status();
        self.last_modified_by = actor.display_name().to_string();
        self.updated_at = now;

        if self.status == DeviationStatus::FinalApproved && self.completed_date.is_none() {
            self.completed_date = Some(now);
            self.total_approval_time_hours = Some(elapsed_whole_hours(self.created_at, now));
        }

        Ok(self.status)
    }

    /// Terminate the workflow. Previously-approved stages are preserved as
    /// history; only the status, reason, and audit fields change.
    pub fn reject(
        &mut self,
        reason: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        if self.status.is_terminal() {
            return Err(WorkflowError::TerminalState { status: self.status });
        }
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(WorkflowError::EmptyRejectionReason);
        }

        self.status = DeviationStatus::Rejected;
        self.rejection_reason = Some(reason.to_string());
        self.last_modified_by = actor.display_name().to_string();
        self.updated_at = now;
        Ok(())
    }
}

fn elapsed_whole_hours(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    ((to - from).num_milliseconds() as f64 / 3_600_000.0).round() as i64
}

/// Applies workflow transitions and records each attempt on an audit sink
/// (both the applied and the refused ones).
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowEngine;

impl WorkflowEngine {
    pub fn approve_with_audit<S>(
        &self,
        deviation: &mut Deviation,
        stage: ApprovalStage,
        actor: &Actor,
        comments: Option<String>,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<DeviationStatus, WorkflowError>
    where
        S: AuditSink,
    {
        let from = deviation.status;
        let result = deviation.approve(stage, actor, comments, now);
        match &result {
            Ok(to) => sink.emit(
                AuditEvent::new(
                    Some(deviation.id.clone()),
                    audit.correlation_id.clone(),
                    "workflow.stage_approved",
                    AuditCategory::Workflow,
                    audit.actor.clone(),
                    AuditOutcome::Success,
                )
                .with_metadata("stage", stage.as_str())
                .with_metadata("from", from.as_str())
                .with_metadata("to", to.as_str()),
            ),
            Err(error) => sink.emit(
                AuditEvent::new(
                    Some(deviation.id.clone()),
                    audit.correlation_id.clone(),
                    "workflow.transition_rejected",
                    AuditCategory::Workflow,
                    audit.actor.clone(),
                    AuditOutcome::Rejected,
                )
                .with_metadata("stage", stage.as_str())
                .with_metadata("error", error.to_string()),
            ),
        }
        result
    }

    pub fn reject_with_audit<S>(
        &self,
        deviation: &mut Deviation,
        reason: &str,
        actor: &Actor,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<(), WorkflowError>
    where
        S: AuditSink,
    {
        let from = deviation.status;
        let result = deviation.reject(reason, actor, now);
        match &result {
            Ok(()) => sink.emit(
                AuditEvent::new(
                    Some(deviation.id.clone()),
                    audit.correlation_id.clone(),
                    "workflow.rejected",
                    AuditCategory::Workflow,
                    audit.actor.clone(),
                    AuditOutcome::Success,
                )
                .with_metadata("from", from.as_str())
                .with_metadata("reason", reason.trim()),
            ),
            Err(error) => sink.emit(
                AuditEvent::new(
                    Some(deviation.id.clone()),
                    audit.correlation_id.clone(),
                    "workflow.transition_rejected",
                    AuditCategory::Workflow,
                    audit.actor.clone(),
                    AuditOutcome::Rejected,
                )
                .with_metadata("error", error.to_string()),
            ),
        }
        result
    }
}
