//! Job store for the build farm.
//!
//! Provides the `JobStore` trait with PostgreSQL and in-memory
//! implementations. Both implement the job claim as a single atomic
//! compare-and-set.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{DbError, DbResult};
pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;
pub use store::{JobStore, NewBuild};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
