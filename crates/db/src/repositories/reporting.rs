use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sqlx::Row;

use super::{CountBucket, DashboardStats, MonthBucket, ReportingRepository, RepositoryError};
use crate::DbPool;

pub struct SqlReportingRepository {
    pool: DbPool,
}

impl SqlReportingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn grouped_counts(&self, column: &str) -> Result<Vec<CountBucket>, RepositoryError> {
        // `column` is one of our own identifiers, never caller input.
        let rows = sqlx::query(&format!(
            "SELECT {column} AS key, COUNT(*) AS count FROM deviation \
             GROUP BY {column} ORDER BY count DESC, key"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CountBucket {
                    key: row
                        .try_get("key")
                        .map_err(|error| RepositoryError::Decode(error.to_string()))?,
                    count: row
                        .try_get("count")
                        .map_err(|error| RepositoryError::Decode(error.to_string()))?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ReportingRepository for SqlReportingRepository {
    async fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats, RepositoryError> {
        let by_status = self.grouped_counts("status").await?;
        let by_department = self.grouped_counts("department").await?;
        let by_risk = self.grouped_counts("quality_risk").await?;

        let months = trailing_months(now, 12);
        let window_start = format!("{}-01", months[0]);
        let trend_rows = sqlx::query(
            "SELECT substr(created_at, 1, 7) AS month, COUNT(*) AS count FROM deviation
             WHERE substr(created_at, 1, 10) >= ?
             GROUP BY month",
        )
        .bind(&window_start)
        .fetch_all(&self.pool)
        .await?;

        let mut monthly_trend: Vec<MonthBucket> =
            months.into_iter().map(|month| MonthBucket { month, count: 0 }).collect();
        for row in &trend_rows {
            let month: String = row
                .try_get("month")
                .map_err(|error| RepositoryError::Decode(error.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|error| RepositoryError::Decode(error.to_string()))?;
            if let Some(bucket) = monthly_trend.iter_mut().find(|bucket| bucket.month == month) {
                bucket.count = count;
            }
        }

        let avg_approval_time_hours: Option<f64> = sqlx::query(
            "SELECT AVG(total_approval_time_hours) AS avg_hours FROM deviation
             WHERE total_approval_time_hours IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?
        .try_get("avg_hours")
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        Ok(DashboardStats {
            by_status,
            by_department,
            by_risk,
            monthly_trend,
            avg_approval_time_hours,
        })
    }
}

/// The last `count` calendar months ending at `now`, oldest first, as
/// `YYYY-MM` keys matching the `substr` of an RFC 3339 timestamp.
fn trailing_months(now: DateTime<Utc>, count: u32) -> Vec<String> {
    let mut year = now.year();
    let mut month = now.month() as i32;
    let mut keys = Vec::with_capacity(count as usize);
    for _ in 0..count {
        keys.push(format!("{year:04}-{month:02}"));
        month -= 1;
        if month == 0 {
            month = 12;
            year -= 1;
        }
    }
    keys.reverse();
    keys
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use conforma_core::domain::actor::Actor;
    use conforma_core::domain::deviation::DeviationStatus;
    use conforma_core::workflow::ApprovalStage;

    use super::{trailing_months, SqlReportingRepository};
    use crate::repositories::deviation::tests::{sample_deviation, setup};
    use crate::repositories::{DeviationRepository, ReportingRepository, SqlDeviationRepository};

    #[test]
    fn trailing_months_cover_a_year_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 2, 10, 12, 0, 0).unwrap();
        let months = trailing_months(now, 12);
        assert_eq!(months.len(), 12);
        assert_eq!(months.first().map(String::as_str), Some("2023-03"));
        assert_eq!(months.last().map(String::as_str), Some("2024-02"));
    }

    #[tokio::test]
    async fn dashboard_aggregates_status_department_risk_and_trend() {
        let pool = setup().await;
        let deviations = SqlDeviationRepository::new(pool.clone());
        let reporting = SqlReportingRepository::new(pool);

        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();

        let mut first = sample_deviation("d-1", "2024-001");
        first.created_at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        deviations.insert(&first).await.expect("insert d-1");

        let mut second = sample_deviation("d-2", "2024-002");
        second.department = "Uretim".to_string();
        second.created_at = Utc.with_ymd_and_hms(2024, 2, 20, 8, 0, 0).unwrap();
        second.status = DeviationStatus::Rejected;
        deviations.insert(&second).await.expect("insert d-2");

        let stats = reporting.dashboard_stats(now).await.expect("stats");

        assert_eq!(stats.by_status.iter().map(|bucket| bucket.count).sum::<i64>(), 2);
        assert!(stats
            .by_department
            .iter()
            .any(|bucket| bucket.key == "Kalite" && bucket.count == 1));
        assert!(stats.by_risk.iter().any(|bucket| bucket.key == "high" && bucket.count == 2));

        assert_eq!(stats.monthly_trend.len(), 12);
        let march = stats
            .monthly_trend
            .iter()
            .find(|bucket| bucket.month == "2024-03")
            .expect("march bucket");
        assert_eq!(march.count, 1);
        let february = stats
            .monthly_trend
            .iter()
            .find(|bucket| bucket.month == "2024-02")
            .expect("february bucket");
        assert_eq!(february.count, 1);
        // Months with no records are present with zero counts.
        assert!(stats.monthly_trend.iter().any(|bucket| bucket.count == 0));
    }

    #[tokio::test]
    async fn average_approval_time_spans_completed_records_only() {
        let pool = setup().await;
        let deviations = SqlDeviationRepository::new(pool.clone());
        let reporting = SqlReportingRepository::new(pool);
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();

        // One record never completed, two completed in 10 and 30 hours.
        deviations.insert(&sample_deviation("d-1", "2024-001")).await.expect("insert d-1");
        for (id, number, hours) in [("d-2", "2024-002", 10), ("d-3", "2024-003", 30)] {
            let mut completed = sample_deviation(id, number);
            let actor = Actor::authenticated("u-1", "Aylin");
            for stage in ApprovalStage::ALL {
                completed
                    .approve(
                        stage,
                        &actor,
                        None,
                        completed.created_at + chrono::Duration::hours(hours),
                    )
                    .expect("approve");
            }
            deviations.insert(&completed).await.expect("insert completed");
        }

        let stats = reporting.dashboard_stats(now).await.expect("stats");
        assert_eq!(stats.avg_approval_time_hours, Some(20.0));
    }
}
