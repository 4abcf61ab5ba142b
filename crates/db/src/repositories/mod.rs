use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use conforma_core::domain::actor::Actor;
use conforma_core::domain::deviation::{
    Deviation, DeviationId, DeviationStatus, DeviationType, QualityRisk,
};

pub mod deviation;
pub mod identity;
pub mod reporting;
pub mod sequence;

pub use deviation::SqlDeviationRepository;
pub use identity::SqlIdentityRepository;
pub use reporting::SqlReportingRepository;
pub use sequence::SqlSequenceRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("deviation number `{0}` already exists")]
    DuplicateNumber(String),
    #[error("revision conflict on deviation `{id}` (expected revision {expected})")]
    RevisionConflict { id: String, expected: i64 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviationFilter {
    pub status: Option<DeviationStatus>,
    pub department: Option<String>,
    pub deviation_type: Option<DeviationType>,
    pub quality_risk: Option<QualityRisk>,
    pub search: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    CreatedAt,
    RequestDate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListQuery {
    pub filter: DeviationFilter,
    pub page: u32,
    pub limit: u32,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: DeviationFilter::default(),
            page: 1,
            limit: 20,
            sort_field: SortField::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl ListQuery {
    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }
}

/// Status counts over the filtered set (the status filter itself excluded, so
/// the breakdown always shows the full workflow mix). `in_progress` sums the
/// three mid-stage statuses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusBreakdown {
    pub pending: i64,
    pub in_progress: i64,
    pub approved: i64,
    pub rejected: i64,
    pub total: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListResult {
    pub items: Vec<Deviation>,
    pub total: i64,
    pub breakdown: StatusBreakdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountBucket {
    pub key: String,
    pub count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonthBucket {
    pub month: String,
    pub count: i64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DashboardStats {
    pub by_status: Vec<CountBucket>,
    pub by_department: Vec<CountBucket>,
    pub by_risk: Vec<CountBucket>,
    pub monthly_trend: Vec<MonthBucket>,
    pub avg_approval_time_hours: Option<f64>,
}

#[async_trait]
pub trait DeviationRepository: Send + Sync {
    async fn insert(&self, deviation: &Deviation) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: &DeviationId) -> Result<Option<Deviation>, RepositoryError>;

    /// Persists the record, expecting `deviation.revision` to still be the
    /// stored revision. Bumps it by one on success and returns the new value;
    /// a stale revision fails with [`RepositoryError::RevisionConflict`].
    async fn update(&self, deviation: &Deviation) -> Result<i64, RepositoryError>;

    /// Administrative delete, bypassing the workflow. Returns whether a
    /// record existed.
    async fn delete(&self, id: &DeviationId) -> Result<bool, RepositoryError>;

    async fn list(&self, query: &ListQuery) -> Result<ListResult, RepositoryError>;

    /// Administrative batch override that bypasses the state machine. When
    /// the target status is `rejected`, `reason` is stored on every record.
    /// Returns the modified count.
    async fn bulk_update_status(
        &self,
        ids: &[DeviationId],
        status: DeviationStatus,
        reason: Option<&str>,
        actor: &Actor,
    ) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait SequenceRepository: Send + Sync {
    /// Atomically claims the next number for the given year, `YYYY-NNN`.
    async fn next_number(&self, year: i32) -> Result<String, RepositoryError>;
}

#[async_trait]
pub trait ReportingRepository: Send + Sync {
    /// Dashboard aggregates; `now` anchors the trailing 12-month trend.
    async fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats, RepositoryError>;
}

#[async_trait]
pub trait IdentityRepository: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, RepositoryError>;
}
