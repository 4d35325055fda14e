/// The game store lives in `game`; this module only owns the pool.
pub mod game;

/// Storage is SQLite behind sqlx; nothing outside `db` issues queries.
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

#[derive(Clone)]
pub struct Pool(pub SqlitePool);

impl Pool {
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(database_path).await?;
        Ok(Pool(pool))
    }

    /// An in-memory database on a single connection, for tests and local
    /// experiments. A second connection would see a different empty
    /// database, hence the cap.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Pool(pool))
    }
}
