use async_trait::async_trait;
use sqlx::Row;

use conforma_core::numbering;

use super::{RepositoryError, SequenceRepository};
use crate::DbPool;

/// Issues deviation numbers from a per-year counter row. The claim is a
/// single upsert-with-increment statement, so concurrent creators can never
/// observe the same counter value.
pub struct SqlSequenceRepository {
    pool: DbPool,
}

impl SqlSequenceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SequenceRepository for SqlSequenceRepository {
    async fn next_number(&self, year: i32) -> Result<String, RepositoryError> {
        let row = sqlx::query(
            "INSERT INTO deviation_sequence (year, counter) VALUES (?, 1)
             ON CONFLICT(year) DO UPDATE SET counter = counter + 1
             RETURNING counter",
        )
        .bind(year)
        .fetch_one(&self.pool)
        .await?;

        let counter: i64 =
            row.try_get("counter").map_err(|error| RepositoryError::Decode(error.to_string()))?;
        Ok(numbering::format_number(year, counter as u32))
    }
}
