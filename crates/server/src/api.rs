//! REST endpoints for deviation approvals.
//!
//! All routes live under `/api/deviation-approvals`:
//! - `GET    /dashboard`        — aggregated dashboard stats
//! - `PATCH  /bulk/status`      — administrative bulk status override
//! - `GET    /`                 — filtered, paginated listing
//! - `POST   /`                 — create a deviation
//! - `GET    /{id}`             — fetch one deviation
//! - `PATCH  /{id}`             — partial update
//! - `DELETE /{id}`             — administrative delete
//! - `PATCH  /{id}/approve`     — sign off one stage (`{approvalType, comments?}`)
//! - `PATCH  /{id}/reject`      — terminate the workflow (`{reason}`)
//!
//! Every response uses the `{success, data?, message?, pagination?, stats?,
//! error?}` envelope with camelCase field names.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch},
    Json, Router,
};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use conforma_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
use conforma_core::domain::actor::Actor;
use conforma_core::errors::ApplicationError;
use conforma_core::domain::deviation::{
    Attachment, Deviation, DeviationId, DeviationStatus, DeviationType, QualityRisk,
    StageApproval, Vehicle,
};
use conforma_core::workflow::{ApprovalStage, WorkflowEngine};
use conforma_db::repositories::{
    DeviationFilter, DeviationRepository, IdentityRepository, ListQuery, ReportingRepository,
    RepositoryError, SequenceRepository, SortField, SortOrder, SqlDeviationRepository,
    SqlIdentityRepository, SqlReportingRepository, SqlSequenceRepository,
};
use conforma_db::DbPool;

#[derive(Clone)]
pub struct ApiState {
    db_pool: DbPool,
    audit: Arc<dyn AuditSink>,
}

type ApiReply = (StatusCode, Json<Value>);
type ApiResult = Result<ApiReply, ApiReply>;

pub fn router(db_pool: DbPool) -> Router {
    router_with_audit(db_pool, Arc::new(TracingAuditSink))
}

pub fn router_with_audit(db_pool: DbPool, audit: Arc<dyn AuditSink>) -> Router {
    Router::new()
        .route("/api/deviation-approvals/dashboard", get(dashboard))
        .route("/api/deviation-approvals/bulk/status", patch(bulk_update_status))
        .route("/api/deviation-approvals", get(list_deviations).post(create_deviation))
        .route(
            "/api/deviation-approvals/{id}",
            get(get_deviation).patch(update_deviation).delete(delete_deviation),
        )
        .route("/api/deviation-approvals/{id}/approve", patch(approve_deviation))
        .route("/api/deviation-approvals/{id}/reject", patch(reject_deviation))
        .with_state(ApiState { db_pool, audit })
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// `axum::Json` rejects malformed bodies with 422; the API contract wants
/// every validation failure as a 400 envelope, so requests come through this
/// wrapper instead.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiReply;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => {
                Err(failure(StatusCode::BAD_REQUEST, format!("invalid request body: {rejection}")))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleInput {
    pub id: Option<String>,
    pub model: String,
    pub serial_number: String,
    pub chassis_number: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInput {
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviationRequest {
    pub part_name: Option<String>,
    pub part_number: Option<String>,
    pub vehicles: Option<Vec<VehicleInput>>,
    pub deviation_type: Option<String>,
    pub quality_risk: Option<String>,
    pub description: Option<String>,
    pub reason_for_deviation: Option<String>,
    pub proposed_solution: Option<String>,
    pub request_date: Option<String>,
    pub requested_by: Option<String>,
    pub department: Option<String>,
    pub attachments: Option<Vec<AttachmentInput>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeviationRequest {
    pub part_name: Option<String>,
    pub part_number: Option<String>,
    pub vehicles: Option<Vec<VehicleInput>>,
    pub deviation_type: Option<String>,
    pub quality_risk: Option<String>,
    pub description: Option<String>,
    pub reason_for_deviation: Option<String>,
    pub proposed_solution: Option<String>,
    pub request_date: Option<String>,
    pub requested_by: Option<String>,
    pub department: Option<String>,
    pub attachments: Option<Vec<AttachmentInput>>,
    pub revision: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub approval_type: Option<String>,
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkStatusRequest {
    pub ids: Option<Vec<String>>,
    pub status: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub status: Option<String>,
    pub department: Option<String>,
    pub deviation_type: Option<String>,
    pub quality_risk: Option<String>,
    pub search: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StageDto {
    approved: bool,
    approver: Option<String>,
    approval_date: Option<String>,
    comments: Option<String>,
}

impl From<&StageApproval> for StageDto {
    fn from(stage: &StageApproval) -> Self {
        Self {
            approved: stage.approved,
            approver: stage.approver.clone(),
            approval_date: stage.approval_date.map(|date| date.to_rfc3339()),
            comments: stage.comments.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VehicleDto {
    id: String,
    model: String,
    serial_number: String,
    chassis_number: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentDto {
    id: String,
    name: String,
    #[serde(rename = "type")]
    content_type: String,
    data: String,
    upload_date: String,
    uploaded_by: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviationDto {
    id: String,
    deviation_number: String,
    part_name: String,
    part_number: String,
    vehicles: Vec<VehicleDto>,
    deviation_type: String,
    quality_risk: String,
    description: String,
    reason_for_deviation: Option<String>,
    proposed_solution: Option<String>,
    request_date: String,
    requested_by: String,
    department: String,
    rd_approval: StageDto,
    quality_approval: StageDto,
    production_approval: StageDto,
    general_manager_approval: StageDto,
    status: String,
    rejection_reason: Option<String>,
    attachments: Vec<AttachmentDto>,
    created_by: String,
    last_modified_by: String,
    completed_date: Option<String>,
    total_approval_time_hours: Option<i64>,
    revision: i64,
    created_at: String,
    updated_at: String,
}

impl From<&Deviation> for DeviationDto {
    fn from(deviation: &Deviation) -> Self {
        Self {
            id: deviation.id.0.clone(),
            deviation_number: deviation.deviation_number.clone(),
            part_name: deviation.part_name.clone(),
            part_number: deviation.part_number.clone(),
            vehicles: deviation
                .vehicles
                .iter()
                .map(|vehicle| VehicleDto {
                    id: vehicle.id.clone(),
                    model: vehicle.model.clone(),
                    serial_number: vehicle.serial_number.clone(),
                    chassis_number: vehicle.chassis_number.clone(),
                })
                .collect(),
            deviation_type: deviation.deviation_type.as_str().to_string(),
            quality_risk: deviation.quality_risk.as_str().to_string(),
            description: deviation.description.clone(),
            reason_for_deviation: deviation.reason_for_deviation.clone(),
            proposed_solution: deviation.proposed_solution.clone(),
            request_date: deviation.request_date.format("%Y-%m-%d").to_string(),
            requested_by: deviation.requested_by.clone(),
            department: deviation.department.clone(),
            rd_approval: StageDto::from(&deviation.rd_approval),
            quality_approval: StageDto::from(&deviation.quality_approval),
            production_approval: StageDto::from(&deviation.production_approval),
            general_manager_approval: StageDto::from(&deviation.general_manager_approval),
            status: deviation.status.as_str().to_string(),
            rejection_reason: deviation.rejection_reason.clone(),
            attachments: deviation
                .attachments
                .iter()
                .map(|attachment| AttachmentDto {
                    id: attachment.id.clone(),
                    name: attachment.name.clone(),
                    content_type: attachment.content_type.clone(),
                    data: attachment.data.clone(),
                    upload_date: attachment.upload_date.to_rfc3339(),
                    uploaded_by: attachment.uploaded_by.clone(),
                })
                .collect(),
            created_by: deviation.created_by.clone(),
            last_modified_by: deviation.last_modified_by.clone(),
            completed_date: deviation.completed_date.map(|date| date.to_rfc3339()),
            total_approval_time_hours: deviation.total_approval_time_hours,
            revision: deviation.revision,
            created_at: deviation.created_at.to_rfc3339(),
            updated_at: deviation.updated_at.to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_deviation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<CreateDeviationRequest>,
) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();

    let mut missing = Vec::new();
    let part_name = required_field(&body.part_name, "partName", &mut missing);
    let part_number = required_field(&body.part_number, "partNumber", &mut missing);
    let deviation_type_raw = required_field(&body.deviation_type, "deviationType", &mut missing);
    let description = required_field(&body.description, "description", &mut missing);
    let request_date_raw = required_field(&body.request_date, "requestDate", &mut missing);
    let requested_by = required_field(&body.requested_by, "requestedBy", &mut missing);
    let department = required_field(&body.department, "department", &mut missing);
    if !missing.is_empty() {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            format!("missing required fields: {}", missing.join(", ")),
        ));
    }

    let deviation_type = DeviationType::parse(&deviation_type_raw)
        .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?;
    let quality_risk = match body.quality_risk.as_deref().map(str::trim).filter(|s| !s.is_empty())
    {
        Some(raw) => QualityRisk::parse(raw)
            .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?,
        None => QualityRisk::Low,
    };
    let request_date = NaiveDate::parse_from_str(&request_date_raw, "%Y-%m-%d").map_err(|_| {
        failure(
            StatusCode::BAD_REQUEST,
            format!("invalid request date `{request_date_raw}` (expected YYYY-MM-DD)"),
        )
    })?;

    let actor = resolve_actor(&state, &headers).await;
    let now = Utc::now();
    let id = DeviationId(Uuid::new_v4().to_string());

    let sequences = SqlSequenceRepository::new(state.db_pool.clone());
    let deviation_number = sequences
        .next_number(request_date.year())
        .await
        .map_err(|e| repository_failure(&correlation_id, e))?;

    let deviation = Deviation {
        id: id.clone(),
        deviation_number: deviation_number.clone(),
        part_name,
        part_number,
        vehicles: body.vehicles.unwrap_or_default().into_iter().map(vehicle_from_input).collect(),
        deviation_type,
        quality_risk,
        description,
        reason_for_deviation: optional_text(body.reason_for_deviation),
        proposed_solution: optional_text(body.proposed_solution),
        request_date,
        requested_by,
        department,
        rd_approval: StageApproval::unapproved(),
        quality_approval: StageApproval::unapproved(),
        production_approval: StageApproval::unapproved(),
        general_manager_approval: StageApproval::unapproved(),
        status: DeviationStatus::Pending,
        rejection_reason: None,
        attachments: body
            .attachments
            .unwrap_or_default()
            .into_iter()
            .map(|input| attachment_from_input(input, &actor, now))
            .collect(),
        created_by: actor.display_name().to_string(),
        last_modified_by: actor.display_name().to_string(),
        completed_date: None,
        total_approval_time_hours: None,
        revision: 1,
        created_at: now,
        updated_at: now,
    };

    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    repo.insert(&deviation).await.map_err(|e| repository_failure(&correlation_id, e))?;

    state.audit.emit(
        AuditEvent::new(
            Some(id.clone()),
            correlation_id.clone(),
            "deviation.created",
            AuditCategory::Ingress,
            actor.display_name(),
            AuditOutcome::Success,
        )
        .with_metadata("deviation_number", deviation_number.clone()),
    );
    info!(
        event_name = "api.deviation.created",
        correlation_id = %correlation_id,
        deviation_id = %id,
        deviation_number = %deviation_number,
        "deviation created"
    );

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "data": DeviationDto::from(&deviation) }))))
}

async fn get_deviation(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();
    let id = parse_deviation_id(&id)?;

    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    let deviation = repo
        .find_by_id(&id)
        .await
        .map_err(|e| repository_failure(&correlation_id, e))?
        .ok_or_else(not_found)?;

    Ok((StatusCode::OK, Json(json!({ "success": true, "data": DeviationDto::from(&deviation) }))))
}

async fn update_deviation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<UpdateDeviationRequest>,
) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();
    let id = parse_deviation_id(&id)?;

    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    let mut deviation = repo
        .find_by_id(&id)
        .await
        .map_err(|e| repository_failure(&correlation_id, e))?
        .ok_or_else(not_found)?;

    if let Some(expected) = body.revision {
        if expected != deviation.revision {
            return Err(failure(
                StatusCode::CONFLICT,
                "The record was modified by another request. Reload and retry.",
            ));
        }
    }

    let actor = resolve_actor(&state, &headers).await;
    let now = Utc::now();

    if let Some(value) = body.part_name {
        deviation.part_name = non_empty(value, "partName")?;
    }
    if let Some(value) = body.part_number {
        deviation.part_number = non_empty(value, "partNumber")?;
    }
    if let Some(value) = body.deviation_type {
        deviation.deviation_type = DeviationType::parse(&value)
            .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?;
    }
    if let Some(value) = body.quality_risk {
        deviation.quality_risk = QualityRisk::parse(&value)
            .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?;
    }
    if let Some(value) = body.description {
        deviation.description = non_empty(value, "description")?;
    }
    if let Some(value) = body.reason_for_deviation {
        deviation.reason_for_deviation = optional_text(Some(value));
    }
    if let Some(value) = body.proposed_solution {
        deviation.proposed_solution = optional_text(Some(value));
    }
    if let Some(value) = body.request_date {
        deviation.request_date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
            failure(
                StatusCode::BAD_REQUEST,
                format!("invalid request date `{value}` (expected YYYY-MM-DD)"),
            )
        })?;
    }
    if let Some(value) = body.requested_by {
        deviation.requested_by = non_empty(value, "requestedBy")?;
    }
    if let Some(value) = body.department {
        deviation.department = non_empty(value, "department")?;
    }
    if let Some(vehicles) = body.vehicles {
        deviation.vehicles = vehicles.into_iter().map(vehicle_from_input).collect();
    }
    if let Some(attachments) = body.attachments {
        deviation.attachments = attachments
            .into_iter()
            .map(|input| attachment_from_input(input, &actor, now))
            .collect();
    }

    deviation.last_modified_by = actor.display_name().to_string();
    deviation.updated_at = now;

    let new_revision =
        repo.update(&deviation).await.map_err(|e| repository_failure(&correlation_id, e))?;
    deviation.revision = new_revision;

    info!(
        event_name = "api.deviation.updated",
        correlation_id = %correlation_id,
        deviation_id = %deviation.id,
        "deviation updated"
    );

    Ok((StatusCode::OK, Json(json!({ "success": true, "data": DeviationDto::from(&deviation) }))))
}

async fn delete_deviation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();
    let id = parse_deviation_id(&id)?;

    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    let existed = repo.delete(&id).await.map_err(|e| repository_failure(&correlation_id, e))?;
    if !existed {
        return Err(not_found());
    }

    let actor = resolve_actor(&state, &headers).await;
    state.audit.emit(AuditEvent::new(
        Some(id.clone()),
        correlation_id.clone(),
        "deviation.deleted",
        AuditCategory::Ingress,
        actor.display_name(),
        AuditOutcome::Success,
    ));
    info!(
        event_name = "api.deviation.deleted",
        correlation_id = %correlation_id,
        deviation_id = %id,
        "deviation deleted"
    );

    Ok((StatusCode::OK, Json(json!({ "success": true, "message": "deviation deleted" }))))
}

async fn approve_deviation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<ApproveRequest>,
) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();
    let id = parse_deviation_id(&id)?;

    let stage = body
        .approval_type
        .as_deref()
        .and_then(ApprovalStage::parse)
        .ok_or_else(|| {
            failure(
                StatusCode::BAD_REQUEST,
                "invalid approval type (expected rd|quality|production|generalManager)",
            )
        })?;

    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    let mut deviation = repo
        .find_by_id(&id)
        .await
        .map_err(|e| repository_failure(&correlation_id, e))?
        .ok_or_else(not_found)?;

    let actor = resolve_actor(&state, &headers).await;
    let audit_ctx = AuditContext::new(Some(id.clone()), correlation_id.clone(), actor.display_name());
    WorkflowEngine
        .approve_with_audit(
            &mut deviation,
            stage,
            &actor,
            optional_text(body.comments),
            Utc::now(),
            &state.audit,
            &audit_ctx,
        )
        .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?;

    let new_revision =
        repo.update(&deviation).await.map_err(|e| repository_failure(&correlation_id, e))?;
    deviation.revision = new_revision;

    info!(
        event_name = "api.deviation.stage_approved",
        correlation_id = %correlation_id,
        deviation_id = %deviation.id,
        stage = %stage,
        status = %deviation.status,
        "deviation stage approved"
    );

    Ok((StatusCode::OK, Json(json!({ "success": true, "data": DeviationDto::from(&deviation) }))))
}

async fn reject_deviation(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<RejectRequest>,
) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();
    let id = parse_deviation_id(&id)?;

    let reason = body.reason.as_deref().map(str::trim).filter(|s| !s.is_empty()).ok_or_else(
        || failure(StatusCode::BAD_REQUEST, "a rejection reason is required"),
    )?;

    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    let mut deviation = repo
        .find_by_id(&id)
        .await
        .map_err(|e| repository_failure(&correlation_id, e))?
        .ok_or_else(not_found)?;

    let actor = resolve_actor(&state, &headers).await;
    let audit_ctx = AuditContext::new(Some(id.clone()), correlation_id.clone(), actor.display_name());
    WorkflowEngine
        .reject_with_audit(&mut deviation, reason, &actor, Utc::now(), &state.audit, &audit_ctx)
        .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?;

    let new_revision =
        repo.update(&deviation).await.map_err(|e| repository_failure(&correlation_id, e))?;
    deviation.revision = new_revision;

    info!(
        event_name = "api.deviation.rejected",
        correlation_id = %correlation_id,
        deviation_id = %deviation.id,
        "deviation rejected"
    );

    Ok((StatusCode::OK, Json(json!({ "success": true, "data": DeviationDto::from(&deviation) }))))
}

async fn list_deviations(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();
    let query = list_query_from_params(params)?;

    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    let result = repo.list(&query).await.map_err(|e| repository_failure(&correlation_id, e))?;

    let total_pages = if result.total == 0 {
        0
    } else {
        (result.total + i64::from(query.limit) - 1) / i64::from(query.limit)
    };
    let items: Vec<DeviationDto> = result.items.iter().map(DeviationDto::from).collect();

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": items,
            "pagination": {
                "page": query.page,
                "limit": query.limit,
                "total": result.total,
                "totalPages": total_pages,
            },
            "stats": {
                "pending": result.breakdown.pending,
                "inProgress": result.breakdown.in_progress,
                "approved": result.breakdown.approved,
                "rejected": result.breakdown.rejected,
                "total": result.breakdown.total,
            },
        })),
    ))
}

async fn bulk_update_status(
    State(state): State<ApiState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<BulkStatusRequest>,
) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();

    let raw_ids = body.ids.unwrap_or_default();
    if raw_ids.is_empty() {
        return Err(failure(StatusCode::BAD_REQUEST, "ids must not be empty"));
    }
    let ids = raw_ids
        .iter()
        .map(|raw| parse_deviation_id(raw))
        .collect::<Result<Vec<_>, _>>()?;

    let status_raw = body
        .status
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| failure(StatusCode::BAD_REQUEST, "missing required fields: status"))?;
    let status = DeviationStatus::parse(status_raw)
        .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?;

    let reason = body.reason.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if status == DeviationStatus::Rejected && reason.is_none() {
        return Err(failure(
            StatusCode::BAD_REQUEST,
            "a reason is required when bulk-setting status `rejected`",
        ));
    }

    let actor = resolve_actor(&state, &headers).await;
    let repo = SqlDeviationRepository::new(state.db_pool.clone());
    let modified = repo
        .bulk_update_status(&ids, status, reason, &actor)
        .await
        .map_err(|e| repository_failure(&correlation_id, e))?;

    state.audit.emit(
        AuditEvent::new(
            None,
            correlation_id.clone(),
            "deviation.bulk_status_override",
            AuditCategory::Ingress,
            actor.display_name(),
            AuditOutcome::Success,
        )
        .with_metadata("status", status.as_str())
        .with_metadata("requested", raw_ids.len().to_string())
        .with_metadata("modified", modified.to_string()),
    );
    info!(
        event_name = "api.deviation.bulk_status_override",
        correlation_id = %correlation_id,
        status = %status,
        modified = modified,
        "bulk status override applied"
    );

    Ok((
        StatusCode::OK,
        Json(json!({ "success": true, "data": { "modifiedCount": modified } })),
    ))
}

async fn dashboard(State(state): State<ApiState>) -> ApiResult {
    let correlation_id = Uuid::new_v4().to_string();

    let repo = SqlReportingRepository::new(state.db_pool.clone());
    let stats = repo
        .dashboard_stats(Utc::now())
        .await
        .map_err(|e| repository_failure(&correlation_id, e))?;

    let buckets = |entries: &[conforma_db::repositories::CountBucket]| -> Vec<Value> {
        entries
            .iter()
            .map(|bucket| json!({ "key": bucket.key, "count": bucket.count }))
            .collect()
    };

    Ok((
        StatusCode::OK,
        Json(json!({
            "success": true,
            "data": {
                "byStatus": buckets(&stats.by_status),
                "byDepartment": buckets(&stats.by_department),
                "byRisk": buckets(&stats.by_risk),
                "monthlyTrend": stats
                    .monthly_trend
                    .iter()
                    .map(|bucket| json!({ "month": bucket.month, "count": bucket.count }))
                    .collect::<Vec<Value>>(),
                "avgApprovalTimeHours": stats.avg_approval_time_hours,
            },
        })),
    ))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn resolve_actor(state: &ApiState, headers: &HeaderMap) -> Actor {
    let Some(user_id) = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    else {
        return Actor::System;
    };

    let repo = SqlIdentityRepository::new(state.db_pool.clone());
    match repo.display_name(user_id).await {
        Ok(Some(name)) => Actor::authenticated(user_id, name),
        Ok(None) => Actor::System,
        Err(error) => {
            warn!(
                event_name = "api.identity.lookup_failed",
                user_id = %user_id,
                error = %error,
                "identity lookup failed, falling back to system actor"
            );
            Actor::System
        }
    }
}

fn list_query_from_params(params: ListParams) -> Result<ListQuery, ApiReply> {
    let mut filter = DeviationFilter::default();
    if let Some(raw) = params.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        filter.status = Some(
            DeviationStatus::parse(raw)
                .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?,
        );
    }
    if let Some(raw) = params.deviation_type.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        filter.deviation_type = Some(
            DeviationType::parse(raw)
                .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?,
        );
    }
    if let Some(raw) = params.quality_risk.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        filter.quality_risk = Some(
            QualityRisk::parse(raw)
                .map_err(|error| failure(StatusCode::BAD_REQUEST, error.to_string()))?,
        );
    }
    filter.department = params.department.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    filter.search = params.search.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let sort_field = match params.sort_by.as_deref().map(str::trim) {
        None | Some("") | Some("createdAt") | Some("created_at") => SortField::CreatedAt,
        Some("requestDate") | Some("request_date") => SortField::RequestDate,
        Some(other) => {
            return Err(failure(
                StatusCode::BAD_REQUEST,
                format!("invalid sort field `{other}` (expected createdAt|requestDate)"),
            ));
        }
    };
    let sort_order = match params.sort_order.as_deref().map(str::trim) {
        None | Some("") | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => {
            return Err(failure(
                StatusCode::BAD_REQUEST,
                format!("invalid sort order `{other}` (expected asc|desc)"),
            ));
        }
    };

    Ok(ListQuery {
        filter,
        page: params.page.unwrap_or(1).max(1),
        limit: params.limit.unwrap_or(20).clamp(1, 100),
        sort_field,
        sort_order,
    })
}

fn vehicle_from_input(input: VehicleInput) -> Vehicle {
    Vehicle {
        id: input.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        model: input.model,
        serial_number: input.serial_number,
        chassis_number: input.chassis_number,
    }
}

fn attachment_from_input(
    input: AttachmentInput,
    actor: &Actor,
    now: chrono::DateTime<Utc>,
) -> Attachment {
    Attachment {
        id: input.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: input.name,
        content_type: input.content_type,
        data: input.data,
        upload_date: now,
        uploaded_by: actor.display_name().to_string(),
    }
}

fn required_field(value: &Option<String>, name: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => value.to_string(),
        None => {
            missing.push(name);
            String::new()
        }
    }
}

fn non_empty(value: String, name: &str) -> Result<String, ApiReply> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(failure(StatusCode::BAD_REQUEST, format!("{name} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn optional_text(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_deviation_id(raw: &str) -> Result<DeviationId, ApiReply> {
    Uuid::parse_str(raw.trim())
        .map(|_| DeviationId(raw.trim().to_string()))
        .map_err(|_| failure(StatusCode::BAD_REQUEST, format!("invalid deviation id `{raw}`")))
}

fn not_found() -> ApiReply {
    failure(StatusCode::NOT_FOUND, ApplicationError::NotFound("deviation".to_string()).user_message())
}

fn failure(status: StatusCode, message: impl Into<String>) -> ApiReply {
    (status, Json(json!({ "success": false, "error": message.into() })))
}

fn repository_failure(correlation_id: &str, error: RepositoryError) -> ApiReply {
    let app_error = match error {
        RepositoryError::RevisionConflict { id, expected } => {
            ApplicationError::Conflict(format!("revision {expected} was stale for deviation `{id}`"))
        }
        other => ApplicationError::Persistence(other.to_string()),
    };

    match &app_error {
        ApplicationError::Conflict(_) => failure(StatusCode::CONFLICT, app_error.user_message()),
        _ => {
            error!(
                event_name = "api.persistence_error",
                correlation_id = %correlation_id,
                error = %app_error,
                "request failed on persistence"
            );
            // Raw error text stays out of release builds.
            let message = if cfg!(debug_assertions) {
                app_error.to_string()
            } else {
                app_error.user_message()
            };
            failure(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }
}
