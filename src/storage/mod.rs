use crate::controller::ControllerPersist;
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};
use std::path::Path;
use tracing::{debug, info};

const PERSIST_KEY: &str = "controller_persist";

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create the database directory if it doesn't exist
        if !database_url.contains(":memory:") {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            let path = path.split('?').next().unwrap_or(path);
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePool::connect(database_url).await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS controller_state (
                key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_persist(&self, persist: &ControllerPersist) -> Result<()> {
        let data = persist.to_json()?;

        sqlx::query(
            r#"
            INSERT INTO controller_state (key, data, updated_at)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
                data = excluded.data,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(PERSIST_KEY)
        .bind(&data)
        .execute(&self.pool)
        .await?;

        debug!("Saved persist ({} bytes)", data.len());
        Ok(())
    }

    /// The stored tracking sets, each capped at `max_len`. `None` if nothing
    /// has been saved yet.
    pub async fn load_persist(&self, max_len: usize) -> Result<Option<ControllerPersist>> {
        let row = sqlx::query("SELECT data FROM controller_state WHERE key = ?1")
            .bind(PERSIST_KEY)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = row {
            let data: String = row.get("data");
            let persist = ControllerPersist::from_json(&data, max_len)?;
            Ok(Some(persist))
        } else {
            Ok(None)
        }
    }
}
