use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

use conforma_core::domain::actor::Actor;
use conforma_core::domain::deviation::{
    Attachment, Deviation, DeviationId, DeviationStatus, DeviationType, QualityRisk,
    StageApproval, Vehicle,
};
use conforma_core::workflow::ApprovalStage;

use super::{
    DeviationFilter, DeviationRepository, ListQuery, ListResult, RepositoryError, SortField,
    SortOrder, StatusBreakdown,
};
use crate::DbPool;

const DEVIATION_COLUMNS: &str = "id, deviation_number, part_name, part_number, deviation_type, \
     quality_risk, description, reason_for_deviation, proposed_solution, request_date, \
     requested_by, department, status, rejection_reason, created_by, last_modified_by, \
     completed_date, total_approval_time_hours, revision, created_at, updated_at";

pub struct SqlDeviationRepository {
    pool: DbPool,
}

impl SqlDeviationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_children(
        &self,
        deviation: &mut Deviation,
    ) -> Result<(), RepositoryError> {
        let stage_rows = sqlx::query(
            "SELECT stage, approved, approver, approval_date, comments
             FROM deviation_stage WHERE deviation_id = ?",
        )
        .bind(&deviation.id.0)
        .fetch_all(&self.pool)
        .await?;

        for row in &stage_rows {
            let key: String = try_get(row, "stage")?;
            let stage = ApprovalStage::parse(&key)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown stage `{key}`")))?;
            *deviation.stage_mut(stage) = StageApproval {
                approved: try_get::<i64>(row, "approved")? != 0,
                approver: try_get(row, "approver")?,
                approval_date: parse_optional_datetime(try_get(row, "approval_date")?)?,
                comments: try_get(row, "comments")?,
            };
        }

        let vehicle_rows = sqlx::query(
            "SELECT id, model, serial_number, chassis_number
             FROM deviation_vehicle WHERE deviation_id = ? ORDER BY position",
        )
        .bind(&deviation.id.0)
        .fetch_all(&self.pool)
        .await?;

        deviation.vehicles = vehicle_rows
            .iter()
            .map(|row| {
                Ok(Vehicle {
                    id: try_get(row, "id")?,
                    model: try_get(row, "model")?,
                    serial_number: try_get(row, "serial_number")?,
                    chassis_number: try_get(row, "chassis_number")?,
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        let attachment_rows = sqlx::query(
            "SELECT id, name, content_type, data, upload_date, uploaded_by
             FROM deviation_attachment WHERE deviation_id = ? ORDER BY upload_date, id",
        )
        .bind(&deviation.id.0)
        .fetch_all(&self.pool)
        .await?;

        deviation.attachments = attachment_rows
            .iter()
            .map(|row| {
                Ok(Attachment {
                    id: try_get(row, "id")?,
                    name: try_get(row, "name")?,
                    content_type: try_get(row, "content_type")?,
                    data: try_get(row, "data")?,
                    upload_date: parse_datetime(&try_get::<String>(row, "upload_date")?)?,
                    uploaded_by: try_get(row, "uploaded_by")?,
                })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        Ok(())
    }

    async fn status_breakdown(
        &self,
        filter: &DeviationFilter,
    ) -> Result<StatusBreakdown, RepositoryError> {
        let mut builder = QueryBuilder::new(
            "SELECT status, COUNT(*) AS count FROM deviation WHERE 1 = 1",
        );
        push_filters(&mut builder, filter, false);
        builder.push(" GROUP BY status");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut breakdown = StatusBreakdown::default();
        for row in &rows {
            let status: String = try_get(row, "status")?;
            let count: i64 = try_get(row, "count")?;
            match status.as_str() {
                "pending" => breakdown.pending += count,
                "rd-approved" | "quality-approved" | "production-approved" => {
                    breakdown.in_progress += count;
                }
                "final-approved" => breakdown.approved += count,
                "rejected" => breakdown.rejected += count,
                other => {
                    return Err(RepositoryError::Decode(format!("unknown status `{other}`")));
                }
            }
            breakdown.total += count;
        }
        Ok(breakdown)
    }
}

#[async_trait]
impl DeviationRepository for SqlDeviationRepository {
    async fn insert(&self, deviation: &Deviation) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO deviation (id, deviation_number, part_name, part_number, deviation_type,
                                    quality_risk, description, reason_for_deviation,
                                    proposed_solution, request_date, requested_by, department,
                                    status, rejection_reason, created_by, last_modified_by,
                                    completed_date, total_approval_time_hours, revision,
                                    created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&deviation.id.0)
        .bind(&deviation.deviation_number)
        .bind(&deviation.part_name)
        .bind(&deviation.part_number)
        .bind(deviation.deviation_type.as_str())
        .bind(deviation.quality_risk.as_str())
        .bind(&deviation.description)
        .bind(&deviation.reason_for_deviation)
        .bind(&deviation.proposed_solution)
        .bind(deviation.request_date.format("%Y-%m-%d").to_string())
        .bind(&deviation.requested_by)
        .bind(&deviation.department)
        .bind(deviation.status.as_str())
        .bind(&deviation.rejection_reason)
        .bind(&deviation.created_by)
        .bind(&deviation.last_modified_by)
        .bind(deviation.completed_date.map(|date| date.to_rfc3339()))
        .bind(deviation.total_approval_time_hours)
        .bind(deviation.revision)
        .bind(deviation.created_at.to_rfc3339())
        .bind(deviation.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|error| map_unique_violation(&deviation.deviation_number, error))?;

        insert_children(&mut tx, deviation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &DeviationId) -> Result<Option<Deviation>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEVIATION_COLUMNS} FROM deviation WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut deviation = row_to_deviation(&row)?;
        self.load_children(&mut deviation).await?;
        Ok(Some(deviation))
    }

    async fn update(&self, deviation: &Deviation) -> Result<i64, RepositoryError> {
        let expected = deviation.revision;
        let next = expected + 1;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE deviation SET
                 deviation_number = ?, part_name = ?, part_number = ?, deviation_type = ?,
                 quality_risk = ?, description = ?, reason_for_deviation = ?,
                 proposed_solution = ?, request_date = ?, requested_by = ?, department = ?,
                 status = ?, rejection_reason = ?, last_modified_by = ?, completed_date = ?,
                 total_approval_time_hours = ?, revision = ?, updated_at = ?
             WHERE id = ? AND revision = ?",
        )
        .bind(&deviation.deviation_number)
        .bind(&deviation.part_name)
        .bind(&deviation.part_number)
        .bind(deviation.deviation_type.as_str())
        .bind(deviation.quality_risk.as_str())
        .bind(&deviation.description)
        .bind(&deviation.reason_for_deviation)
        .bind(&deviation.proposed_solution)
        .bind(deviation.request_date.format("%Y-%m-%d").to_string())
        .bind(&deviation.requested_by)
        .bind(&deviation.department)
        .bind(deviation.status.as_str())
        .bind(&deviation.rejection_reason)
        .bind(&deviation.last_modified_by)
        .bind(deviation.completed_date.map(|date| date.to_rfc3339()))
        .bind(deviation.total_approval_time_hours)
        .bind(next)
        .bind(deviation.updated_at.to_rfc3339())
        .bind(&deviation.id.0)
        .bind(expected)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::RevisionConflict {
                id: deviation.id.0.clone(),
                expected,
            });
        }

        // Children are replaced wholesale under the revision guard above.
        sqlx::query("DELETE FROM deviation_stage WHERE deviation_id = ?")
            .bind(&deviation.id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM deviation_vehicle WHERE deviation_id = ?")
            .bind(&deviation.id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM deviation_attachment WHERE deviation_id = ?")
            .bind(&deviation.id.0)
            .execute(&mut *tx)
            .await?;
        insert_children(&mut tx, deviation).await?;

        tx.commit().await?;
        Ok(next)
    }

    async fn delete(&self, id: &DeviationId) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM deviation WHERE id = ?").bind(&id.0).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, query: &ListQuery) -> Result<ListResult, RepositoryError> {
        let mut count_builder =
            QueryBuilder::new("SELECT COUNT(*) AS count FROM deviation WHERE 1 = 1");
        push_filters(&mut count_builder, &query.filter, true);
        let total: i64 =
            try_get(&count_builder.build().fetch_one(&self.pool).await?, "count")?;

        let mut page_builder = QueryBuilder::new(format!(
            "SELECT {DEVIATION_COLUMNS} FROM deviation WHERE 1 = 1"
        ));
        push_filters(&mut page_builder, &query.filter, true);
        let sort_column = match query.sort_field {
            SortField::CreatedAt => "created_at",
            SortField::RequestDate => "request_date",
        };
        let sort_direction = match query.sort_order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        page_builder
            .push(format!(" ORDER BY {sort_column} {sort_direction}, id {sort_direction}"))
            .push(" LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset());

        let rows = page_builder.build().fetch_all(&self.pool).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut deviation = row_to_deviation(row)?;
            self.load_children(&mut deviation).await?;
            items.push(deviation);
        }

        let breakdown = self.status_breakdown(&query.filter).await?;
        Ok(ListResult { items, total, breakdown })
    }

    async fn bulk_update_status(
        &self,
        ids: &[DeviationId],
        status: DeviationStatus,
        reason: Option<&str>,
        actor: &Actor,
    ) -> Result<u64, RepositoryError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE deviation SET status = ");
        builder.push_bind(status.as_str());
        // The reason travels only with a rejected status; any other target
        // status clears a leftover reason so the two fields stay coupled.
        builder.push(", rejection_reason = ");
        if status == DeviationStatus::Rejected {
            builder.push_bind(reason.map(str::to_string));
        } else {
            builder.push("NULL");
        }
        builder
            .push(", last_modified_by = ")
            .push_bind(actor.display_name().to_string())
            .push(", updated_at = ")
            .push_bind(Utc::now().to_rfc3339())
            .push(", revision = revision + 1 WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(id.0.clone());
        }
        separated.push_unseparated(")");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

async fn insert_children(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    deviation: &Deviation,
) -> Result<(), RepositoryError> {
    for stage in ApprovalStage::ALL {
        let approval = deviation.stage(stage);
        sqlx::query(
            "INSERT INTO deviation_stage (deviation_id, stage, approved, approver,
                                          approval_date, comments)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&deviation.id.0)
        .bind(stage.as_str())
        .bind(i64::from(approval.approved))
        .bind(&approval.approver)
        .bind(approval.approval_date.map(|date| date.to_rfc3339()))
        .bind(&approval.comments)
        .execute(&mut **tx)
        .await?;
    }

    for (position, vehicle) in deviation.vehicles.iter().enumerate() {
        sqlx::query(
            "INSERT INTO deviation_vehicle (id, deviation_id, position, model, serial_number,
                                            chassis_number)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&vehicle.id)
        .bind(&deviation.id.0)
        .bind(position as i64)
        .bind(&vehicle.model)
        .bind(&vehicle.serial_number)
        .bind(&vehicle.chassis_number)
        .execute(&mut **tx)
        .await?;
    }

    for attachment in &deviation.attachments {
        sqlx::query(
            "INSERT INTO deviation_attachment (id, deviation_id, name, content_type, data,
                                               upload_date, uploaded_by)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attachment.id)
        .bind(&deviation.id.0)
        .bind(&attachment.name)
        .bind(&attachment.content_type)
        .bind(&attachment.data)
        .bind(attachment.upload_date.to_rfc3339())
        .bind(&attachment.uploaded_by)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

fn push_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    filter: &DeviationFilter,
    include_status: bool,
) {
    if include_status {
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
    }
    if let Some(department) = &filter.department {
        builder.push(" AND department = ").push_bind(department.clone());
    }
    if let Some(deviation_type) = filter.deviation_type {
        builder.push(" AND deviation_type = ").push_bind(deviation_type.as_str());
    }
    if let Some(quality_risk) = filter.quality_risk {
        builder.push(" AND quality_risk = ").push_bind(quality_risk.as_str());
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = format!("%{search}%");
        builder
            .push(" AND (deviation_number LIKE ")
            .push_bind(pattern.clone())
            .push(" OR part_name LIKE ")
            .push_bind(pattern.clone())
            .push(" OR part_number LIKE ")
            .push_bind(pattern.clone())
            .push(" OR description LIKE ")
            .push_bind(pattern.clone())
            .push(" OR requested_by LIKE ")
            .push_bind(pattern.clone())
            .push(
                " OR EXISTS (SELECT 1 FROM deviation_vehicle v \
                 WHERE v.deviation_id = deviation.id AND (v.model LIKE ",
            )
            .push_bind(pattern.clone())
            .push(" OR v.serial_number LIKE ")
            .push_bind(pattern)
            .push(")))");
    }
}

fn row_to_deviation(row: &SqliteRow) -> Result<Deviation, RepositoryError> {
    let deviation_type =
        DeviationType::parse(&try_get::<String>(row, "deviation_type")?)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let quality_risk = QualityRisk::parse(&try_get::<String>(row, "quality_risk")?)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    let status = DeviationStatus::parse(&try_get::<String>(row, "status")?)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(Deviation {
        id: DeviationId(try_get(row, "id")?),
        deviation_number: try_get(row, "deviation_number")?,
        part_name: try_get(row, "part_name")?,
        part_number: try_get(row, "part_number")?,
        vehicles: Vec::new(),
        deviation_type,
        quality_risk,
        description: try_get(row, "description")?,
        reason_for_deviation: try_get(row, "reason_for_deviation")?,
        proposed_solution: try_get(row, "proposed_solution")?,
        request_date: parse_date(&try_get::<String>(row, "request_date")?)?,
        requested_by: try_get(row, "requested_by")?,
        department: try_get(row, "department")?,
        rd_approval: StageApproval::unapproved(),
        quality_approval: StageApproval::unapproved(),
        production_approval: StageApproval::unapproved(),
        general_manager_approval: StageApproval::unapproved(),
        status,
        rejection_reason: try_get(row, "rejection_reason")?,
        attachments: Vec::new(),
        created_by: try_get(row, "created_by")?,
        last_modified_by: try_get(row, "last_modified_by")?,
        completed_date: parse_optional_datetime(try_get(row, "completed_date")?)?,
        total_approval_time_hours: try_get(row, "total_approval_time_hours")?,
        revision: try_get(row, "revision")?,
        created_at: parse_datetime(&try_get::<String>(row, "created_at")?)?,
        updated_at: parse_datetime(&try_get::<String>(row, "updated_at")?)?,
    })
}

fn try_get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column).map_err(|error| RepositoryError::Decode(error.to_string()))
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("bad timestamp `{raw}`: {error}")))
}

fn parse_optional_datetime(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    raw.map(|value| parse_datetime(&value)).transpose()
}

fn parse_date(raw: &str) -> Result<NaiveDate, RepositoryError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|error| RepositoryError::Decode(format!("bad date `{raw}`: {error}")))
}

fn map_unique_violation(number: &str, error: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(db_error) = &error {
        if matches!(db_error.kind(), sqlx::error::ErrorKind::UniqueViolation)
            && db_error.message().contains("deviation_number")
        {
            return RepositoryError::DuplicateNumber(number.to_string());
        }
    }
    RepositoryError::Database(error)
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{Duration, NaiveDate, TimeZone, Utc};

    use conforma_core::domain::actor::Actor;
    use conforma_core::domain::deviation::{
        Attachment, Deviation, DeviationId, DeviationStatus, DeviationType, QualityRisk,
        StageApproval, Vehicle,
    };
    use conforma_core::workflow::ApprovalStage;

    use super::SqlDeviationRepository;
    use crate::repositories::{
        DeviationFilter, DeviationRepository, ListQuery, RepositoryError, SortField, SortOrder,
    };
    use crate::{connect_with_settings, migrations};

    pub(crate) async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    pub(crate) fn sample_deviation(id: &str, number: &str) -> Deviation {
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        Deviation {
            id: DeviationId(id.to_string()),
            deviation_number: number.to_string(),
            part_name: "Bracket-A".to_string(),
            part_number: "BR-100".to_string(),
            vehicles: vec![Vehicle {
                id: format!("{id}-veh-1"),
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
            attachments: vec![Attachment {
                id: format!("{id}-att-1"),
                name: "measurement.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                data: "JVBERi0xLjQK".to_string(),
                upload_date: created_at,
                uploaded_by: "Ali".to_string(),
            }],
            created_by: "Ali".to_string(),
            last_modified_by: "Ali".to_string(),
            completed_date: None,
            total_approval_time_hours: None,
            revision: 1,
            created_at,
            updated_at: created_at,
        }
    }

    #[tokio::test]
    async fn insert_and_find_round_trip_preserves_children() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);
        let deviation = sample_deviation("d-1", "2024-001");

        repo.insert(&deviation).await.expect("insert");
        let found = repo
            .find_by_id(&DeviationId("d-1".to_string()))
            .await
            .expect("find")
            .expect("should exist");

        assert_eq!(found, deviation);
    }

    #[tokio::test]
    async fn duplicate_deviation_number_is_reported_as_such() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);

        repo.insert(&sample_deviation("d-1", "2024-001")).await.expect("first insert");
        let error = repo
            .insert(&sample_deviation("d-2", "2024-001"))
            .await
            .expect_err("same number must fail");

        assert!(matches!(error, RepositoryError::DuplicateNumber(number) if number == "2024-001"));
    }

    #[tokio::test]
    async fn update_bumps_revision_and_persists_workflow_state() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);
        let mut deviation = sample_deviation("d-1", "2024-001");
        repo.insert(&deviation).await.expect("insert");

        deviation
            .approve(ApprovalStage::Rd, &Actor::authenticated("u-1", "Ece"), None, Utc::now())
            .expect("approve");
        let new_revision = repo.update(&deviation).await.expect("update");
        assert_eq!(new_revision, 2);

        let found = repo
            .find_by_id(&deviation.id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(found.status, DeviationStatus::RdApproved);
        assert_eq!(found.revision, 2);
        assert!(found.rd_approval.approved);
        assert_eq!(found.rd_approval.approver.as_deref(), Some("Ece"));
    }

    #[tokio::test]
    async fn stale_revision_update_is_a_conflict() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);
        let mut deviation = sample_deviation("d-1", "2024-001");
        repo.insert(&deviation).await.expect("insert");

        repo.update(&deviation).await.expect("first update");

        // Second writer still holds revision 1.
        deviation.description = "changed elsewhere".to_string();
        let error = repo.update(&deviation).await.expect_err("stale write must fail");
        assert!(matches!(
            error,
            RepositoryError::RevisionConflict { ref id, expected: 1 } if id == "d-1"
        ));
    }

    #[tokio::test]
    async fn delete_reports_whether_a_record_existed() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);
        repo.insert(&sample_deviation("d-1", "2024-001")).await.expect("insert");

        assert!(repo.delete(&DeviationId("d-1".to_string())).await.expect("delete"));
        assert!(!repo.delete(&DeviationId("d-1".to_string())).await.expect("second delete"));
        assert!(repo
            .find_by_id(&DeviationId("d-1".to_string()))
            .await
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn list_filters_paginates_and_reports_breakdown() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);

        let mut first = sample_deviation("d-1", "2024-001");
        first.created_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        repo.insert(&first).await.expect("insert d-1");

        let mut second = sample_deviation("d-2", "2024-002");
        second.department = "Uretim".to_string();
        second.status = DeviationStatus::QualityApproved;
        second.created_at = first.created_at + Duration::days(1);
        repo.insert(&second).await.expect("insert d-2");

        let mut third = sample_deviation("d-3", "2024-003");
        third.status = DeviationStatus::Rejected;
        third.rejection_reason = Some("out of spec".to_string());
        third.created_at = first.created_at + Duration::days(2);
        repo.insert(&third).await.expect("insert d-3");

        let all = repo.list(&ListQuery::default()).await.expect("list all");
        assert_eq!(all.total, 3);
        // Default sort is newest first.
        assert_eq!(all.items[0].id.0, "d-3");
        assert_eq!(all.breakdown.pending, 1);
        assert_eq!(all.breakdown.in_progress, 1);
        assert_eq!(all.breakdown.rejected, 1);
        assert_eq!(all.breakdown.total, 3);

        let kalite = repo
            .list(&ListQuery {
                filter: DeviationFilter {
                    department: Some("Kalite".to_string()),
                    ..DeviationFilter::default()
                },
                ..ListQuery::default()
            })
            .await
            .expect("list by department");
        assert_eq!(kalite.total, 2);

        let page = repo
            .list(&ListQuery {
                page: 2,
                limit: 2,
                sort_field: SortField::CreatedAt,
                sort_order: SortOrder::Asc,
                ..ListQuery::default()
            })
            .await
            .expect("second page");
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id.0, "d-3");
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn list_status_filter_keeps_full_breakdown() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);

        repo.insert(&sample_deviation("d-1", "2024-001")).await.expect("insert d-1");
        let mut rejected = sample_deviation("d-2", "2024-002");
        rejected.status = DeviationStatus::Rejected;
        repo.insert(&rejected).await.expect("insert d-2");

        let result = repo
            .list(&ListQuery {
                filter: DeviationFilter {
                    status: Some(DeviationStatus::Rejected),
                    ..DeviationFilter::default()
                },
                ..ListQuery::default()
            })
            .await
            .expect("list rejected");

        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].id.0, "d-2");
        // The breakdown spans all statuses, not just the filtered one.
        assert_eq!(result.breakdown.total, 2);
        assert_eq!(result.breakdown.pending, 1);
    }

    #[tokio::test]
    async fn search_matches_nested_vehicle_fields() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);

        repo.insert(&sample_deviation("d-1", "2024-001")).await.expect("insert d-1");
        let mut other = sample_deviation("d-2", "2024-002");
        other.vehicles[0].serial_number = "SN-9999".to_string();
        repo.insert(&other).await.expect("insert d-2");

        let hits = repo
            .list(&ListQuery {
                filter: DeviationFilter {
                    search: Some("SN-0451".to_string()),
                    ..DeviationFilter::default()
                },
                ..ListQuery::default()
            })
            .await
            .expect("search");

        assert_eq!(hits.total, 1);
        assert_eq!(hits.items[0].id.0, "d-1");
    }

    #[tokio::test]
    async fn bulk_update_sets_status_and_reason_directly() {
        let pool = setup().await;
        let repo = SqlDeviationRepository::new(pool);
        repo.insert(&sample_deviation("d-1", "2024-001")).await.expect("insert d-1");
        repo.insert(&sample_deviation("d-2", "2024-002")).await.expect("insert d-2");

        let modified = repo
            .bulk_update_status(
                &[DeviationId("d-1".to_string()), DeviationId("d-2".to_string())],
                DeviationStatus::Rejected,
                Some("batch recalled"),
                &Actor::System,
            )
            .await
            .expect("bulk update");
        assert_eq!(modified, 2);

        for id in ["d-1", "d-2"] {
            let found = repo
                .find_by_id(&DeviationId(id.to_string()))
                .await
                .expect("find")
                .expect("exists");
            assert_eq!(found.status, DeviationStatus::Rejected);
            assert_eq!(found.rejection_reason.as_deref(), Some("batch recalled"));
            assert_eq!(found.last_modified_by, "System");
            assert_eq!(found.revision, 2);
        }
    }
}
