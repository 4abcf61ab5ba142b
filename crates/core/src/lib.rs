pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod numbering;
pub mod workflow;

pub use domain::actor::Actor;
pub use domain::deviation::{
    Attachment, Deviation, DeviationId, DeviationStatus, DeviationType, QualityRisk,
    StageApproval, Vehicle,
};
pub use errors::{ApplicationError, DomainError};
pub use workflow::{ApprovalStage, WorkflowEngine, WorkflowError};
