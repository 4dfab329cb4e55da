use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::env;
use std::time::Duration;
use tracing::info;

/// Connect to the catalog store.
///
/// `DATABASE_URL` selects the backend (Postgres in production, SQLite for
/// local runs and tests).
pub async fn setup_database() -> anyhow::Result<DatabaseConnection> {
    let url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());

    let mut opts = ConnectOptions::new(&url);
    opts.max_connections(20)
        .min_connections(2)
        .connect_timeout(Duration::from_secs(10))
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(60))
        .sqlx_logging(false);

    let db = Database::connect(opts).await?;
    info!("catalog store connected: {}", redact_url(&url));
    Ok(db)
}

/// Create the catalog tables from the entity definitions. Used for SQLite
/// runs and tests; Postgres deployments migrate out of band.
pub async fn ensure_schema(db: &DatabaseConnection) -> anyhow::Result<()> {
    use crate::entities::prelude::*;
    use sea_orm::{ConnectionTrait, Schema};

    let backend = db.get_database_backend();
    if backend != sea_orm::DatabaseBackend::Sqlite {
        return Ok(());
    }

    let schema = Schema::new(backend);
    db.execute(backend.build(&schema.create_table_from_entity(Users)))
        .await
        .ok();
    db.execute(backend.build(&schema.create_table_from_entity(Tokens)))
        .await
        .ok();
    db.execute(backend.build(&schema.create_table_from_entity(Datasets)))
        .await
        .ok();
    db.execute(backend.build(&schema.create_table_from_entity(UploadSessions)))
        .await
        .ok();
    Ok(())
}

fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("…@{host}"),
        None => url.to_string(),
    }
}
