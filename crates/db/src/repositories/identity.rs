use async_trait::async_trait;
use sqlx::Row;

use super::{IdentityRepository, RepositoryError};
use crate::DbPool;

/// Resolves an authenticated user id to its display name. Callers fall back
/// to the system actor when no row exists.
pub struct SqlIdentityRepository {
    pool: DbPool,
}

impl SqlIdentityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityRepository for SqlIdentityRepository {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT display_name FROM user_account WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            row.try_get("display_name")
                .map_err(|error| RepositoryError::Decode(error.to_string()))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::SqlIdentityRepository;
    use crate::repositories::IdentityRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> sqlx::SqlitePool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn resolves_known_users_and_misses_unknown_ones() {
        let pool = setup().await;
        sqlx::query("INSERT INTO user_account (id, display_name) VALUES ('u-17', 'Ali Demir')")
            .execute(&pool)
            .await
            .expect("seed user");

        let repo = SqlIdentityRepository::new(pool);
        assert_eq!(
            repo.display_name("u-17").await.expect("lookup"),
            Some("Ali Demir".to_string())
        );
        assert_eq!(repo.display_name("u-99").await.expect("lookup"), None);
    }
}
