use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::workflow::ApprovalStage;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviationId(pub String);

impl std::fmt::Display for DeviationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviationType {
    InputControl,
    ProcessControl,
    FinalControl,
}

impl DeviationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputControl => "input-control",
            Self::ProcessControl => "process-control",
            Self::FinalControl => "final-control",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "input-control" => Ok(Self::InputControl),
            "process-control" => Ok(Self::ProcessControl),
            "final-control" => Ok(Self::FinalControl),
            other => Err(DomainError::Validation(format!(
                "unknown deviation type `{other}` (expected input-control|process-control|final-control)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityRisk {
    Low,
    Medium,
    High,
    Critical,
}

impl QualityRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(DomainError::Validation(format!(
                "unknown quality risk `{other}` (expected low|medium|high|critical)"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviationStatus {
    Pending,
    RdApproved,
    QualityApproved,
    ProductionApproved,
    FinalApproved,
    Rejected,
}

impl DeviationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::RdApproved => "rd-approved",
            Self::QualityApproved => "quality-approved",
            Self::ProductionApproved => "production-approved",
            Self::FinalApproved => "final-approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "rd-approved" => Ok(Self::RdApproved),
            "quality-approved" => Ok(Self::QualityApproved),
            "production-approved" => Ok(Self::ProductionApproved),
            "final-approved" => Ok(Self::FinalApproved),
            "rejected" => Ok(Self::Rejected),
            other => Err(DomainError::Validation(format!("unknown deviation status `{other}`"))),
        }
    }

    /// `final-approved` and `rejected` accept no further workflow transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::FinalApproved | Self::Rejected)
    }
}

impl std::fmt::Display for DeviationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub model: String,
    pub serial_number: String,
    pub chassis_number: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageApproval {
    pub approved: bool,
    pub approver: Option<String>,
    pub approval_date: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

impl StageApproval {
    pub fn unapproved() -> Self {
        Self { approved: false, approver: None, approval_date: None, comments: None }
    }
}

impl Default for StageApproval {
    fn default() -> Self {
        Self::unapproved()
    }
}

/// Attachment payload is opaque to the workflow: clients send whatever
/// encoding they use (typically base64) and get the same bytes back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub content_type: String,
    pub data: String,
    pub upload_date: DateTime<Utc>,
    pub uploaded_by: String,
}

/// One non-conformance case with its four-stage departmental sign-off chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deviation {
    pub id: DeviationId,
    pub deviation_number: String,
    pub part_name: String,
    pub part_number: String,
    pub vehicles: Vec<Vehicle>,
    pub deviation_type: DeviationType,
    pub quality_risk: QualityRisk,
    pub description: String,
    pub reason_for_deviation: Option<String>,
    pub proposed_solution: Option<String>,
    pub request_date: NaiveDate,
    pub requested_by: String,
    pub department: String,
    pub rd_approval: StageApproval,
    pub quality_approval: StageApproval,
    pub production_approval: StageApproval,
    pub general_manager_approval: StageApproval,
    pub status: DeviationStatus,
    pub rejection_reason: Option<String>,
    pub attachments: Vec<Attachment>,
    pub created_by: String,
    pub last_modified_by: String,
    pub completed_date: Option<DateTime<Utc>>,
    pub total_approval_time_hours: Option<i64>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deviation {
    pub fn stage(&self, stage: ApprovalStage) -> &StageApproval {
        match stage {
            ApprovalStage::Rd => &self.rd_approval,
            ApprovalStage::Quality => &self.quality_approval,
            ApprovalStage::Production => &self.production_approval,
            ApprovalStage::GeneralManager => &self.general_manager_approval,
        }
    }

    pub fn stage_mut(&mut self, stage: ApprovalStage) -> &mut StageApproval {
        match stage {
            ApprovalStage::Rd => &mut self.rd_approval,
            ApprovalStage::Quality => &mut self.quality_approval,
            ApprovalStage::Production => &mut self.production_approval,
            ApprovalStage::GeneralManager => &mut self.general_manager_approval,
        }
    }

    /// Status implied by the stage flags alone: the highest approved stage
    /// wins. A stored `Rejected` status overrides this derivation and is
    /// never produced by it.
    pub fn derived_status(&self) -> DeviationStatus {
        ApprovalStage::ALL
            .iter()
            .rev()
            .find(|stage| self.stage(**stage).approved)
            .map(|stage| stage.approved_status())
            .unwrap_or(DeviationStatus::Pending)
    }
}

#[cfg(test)]
pub mod fixtures {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::{
        Deviation, DeviationId, DeviationStatus, DeviationType, QualityRisk, StageApproval,
        Vehicle,
    };

    pub fn deviation(id: &str, number: &str) -> Deviation {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        Deviation {
            id: DeviationId(id.to_string()),
            deviation_number: number.to_string(),
            part_name: "Bracket-A".to_string(),
            part_number: "BR-100".to_string(),
            vehicles: vec![Vehicle {
                id: "veh-1".to_string(),
                model: "T-9".to_string(),
                serial_number: "SN-0451".to_string(),
                chassis_number: Some("CH-2210".to_string()),
            }],
            deviation_type: DeviationType::InputControl,
            quality_risk: QualityRisk::High,
            description: "Coating thickness below tolerance".to_string(),
            reason_for_deviation: Some("Supplier batch variance".to_string()),
            proposed_solution: Some("Use with additional inspection".to_string()),
            request_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            requested_by: "Ali".to_string(),
            department: "Kalite".to_string(),
            rd_approval: StageApproval::unapproved(),
            quality_approval: StageApproval::unapproved(),
            production_approval: StageApproval::unapproved(),
            general_manager_approval: StageApproval::unapproved(),
            status: DeviationStatus::Pending,
            rejection_reason: None,
            attachments: Vec::new(),
            created_by: "Ali".to_string(),
            last_modified_by: "Ali".to_string(),
            completed_date: None,
            total_approval_time_hours: None,
            revision: 1,
            created_at,
            updated_at: created_at,
        }
    }
}
