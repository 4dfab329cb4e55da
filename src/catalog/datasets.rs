use crate::entities::datasets::{self, FileEntry};
use crate::entities::prelude::*;
use crate::status::DatasetStatus;
use anyhow::{Result, anyhow};
use chrono::{Duration, Utc};
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};

fn not_deleted() -> sea_orm::Condition {
    sea_orm::Condition::all().add(datasets::Column::DeletedAt.is_null())
}

pub async fn get_by_uuid(
    db: &DatabaseConnection,
    uuid: &str,
) -> Result<Option<datasets::Model>, DbErr> {
    Datasets::find_by_id(uuid).filter(not_deleted()).one(db).await
}

pub async fn get_by_slug(
    db: &DatabaseConnection,
    slug: &str,
) -> Result<Option<datasets::Model>, DbErr> {
    Datasets::find()
        .filter(datasets::Column::Slug.eq(slug))
        .filter(not_deleted())
        .one(db)
        .await
}

pub async fn get_by_numeric_id(
    db: &DatabaseConnection,
    numeric_id: i32,
) -> Result<Option<datasets::Model>, DbErr> {
    Datasets::find()
        .filter(datasets::Column::NumericId.eq(numeric_id))
        .filter(not_deleted())
        .one(db)
        .await
}

pub async fn get_by_owner_and_name(
    db: &DatabaseConnection,
    owner_email: &str,
    name: &str,
) -> Result<Option<datasets::Model>, DbErr> {
    Datasets::find()
        .filter(datasets::Column::OwnerEmail.eq(owner_email))
        .filter(datasets::Column::Name.eq(name))
        .filter(not_deleted())
        .one(db)
        .await
}

/// Global name lookup; more than one hit means the name alone cannot
/// identify a dataset.
pub async fn find_by_name_global(
    db: &DatabaseConnection,
    name: &str,
) -> Result<Vec<datasets::Model>, DbErr> {
    Datasets::find()
        .filter(datasets::Column::Name.eq(name))
        .filter(not_deleted())
        .limit(2)
        .all(db)
        .await
}

pub async fn slug_exists(db: &DatabaseConnection, slug: &str) -> Result<bool, DbErr> {
    Ok(Datasets::find()
        .filter(datasets::Column::Slug.eq(slug))
        .count(db)
        .await?
        > 0)
}

pub async fn max_numeric_id(db: &DatabaseConnection) -> Result<Option<i32>, DbErr> {
    let row = Datasets::find()
        .order_by_desc(datasets::Column::NumericId)
        .one(db)
        .await?;
    Ok(row.map(|d| d.numeric_id))
}

pub async fn insert(
    db: &DatabaseConnection,
    model: datasets::ActiveModel,
) -> Result<datasets::Model, DbErr> {
    model.insert(db).await
}

/// Atomic status transition: succeeds only when the stored status still
/// equals `from`. The claim timestamp follows the status — entering a
/// running state stamps it, leaving one clears it.
pub async fn compare_and_set_status(
    db: &DatabaseConnection,
    uuid: &str,
    from: DatasetStatus,
    to: DatasetStatus,
) -> Result<bool, DbErr> {
    let claimed_at = match to {
        DatasetStatus::Converting | DatasetStatus::Syncing => Some(Utc::now()),
        _ => None,
    };

    let res = Datasets::update_many()
        .col_expr(datasets::Column::Status, Expr::value(to.as_str()))
        .col_expr(datasets::Column::ClaimedAt, Expr::value(claimed_at))
        .col_expr(datasets::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(datasets::Column::Uuid.eq(uuid))
        .filter(datasets::Column::Status.eq(from.as_str()))
        .filter(not_deleted())
        .exec(db)
        .await?;

    Ok(res.rows_affected == 1)
}

/// Oldest-first candidates in a given status, for the claim loop.
pub async fn find_by_status(
    db: &DatabaseConnection,
    status: DatasetStatus,
    limit: u64,
) -> Result<Vec<datasets::Model>, DbErr> {
    Datasets::find()
        .filter(datasets::Column::Status.eq(status.as_str()))
        .filter(not_deleted())
        .order_by_asc(datasets::Column::UpdatedAt)
        .limit(limit)
        .all(db)
        .await
}

/// Queued remote-source pulls. Interactive uploads pass through the same
/// queued status but never carry a source descriptor, so they are not
/// claimable here.
pub async fn find_remote_by_status(
    db: &DatabaseConnection,
    status: DatasetStatus,
    limit: u64,
) -> Result<Vec<datasets::Model>, DbErr> {
    Datasets::find()
        .filter(datasets::Column::Status.eq(status.as_str()))
        .filter(datasets::Column::RemoteSource.is_not_null())
        .filter(not_deleted())
        .order_by_asc(datasets::Column::UpdatedAt)
        .limit(limit)
        .all(db)
        .await
}

/// Conversions claimed before `cutoff` whose worker presumably died.
pub async fn find_stale_claims(
    db: &DatabaseConnection,
    status: DatasetStatus,
    stale_after: Duration,
) -> Result<Vec<datasets::Model>, DbErr> {
    let cutoff = Utc::now() - stale_after;
    Datasets::find()
        .filter(datasets::Column::Status.eq(status.as_str()))
        .filter(datasets::Column::ClaimedAt.lt(cutoff))
        .filter(not_deleted())
        .all(db)
        .await
}

/// Append one entry to `files`. Serialized through a row lock because two
/// concurrent session completions may target the same dataset.
pub async fn append_file(
    db: &DatabaseConnection,
    uuid: &str,
    entry: FileEntry,
) -> Result<(), anyhow::Error> {
    let txn = db.begin().await?;

    let dataset = Datasets::find_by_id(uuid)
        .lock_exclusive()
        .one(&txn)
        .await?
        .ok_or_else(|| anyhow!("dataset not found: {uuid}"))?;

    let mut files: Vec<FileEntry> = serde_json::from_value(dataset.files.clone())?;
    files.push(entry);

    let mut active: datasets::ActiveModel = dataset.into();
    active.files = Set(serde_json::json!(files));
    active.updated_at = Set(Utc::now());
    active.update(&txn).await?;

    txn.commit().await?;
    Ok(())
}

pub async fn set_error_message(
    db: &DatabaseConnection,
    uuid: &str,
    message: Option<&str>,
) -> Result<(), DbErr> {
    Datasets::update_many()
        .col_expr(
            datasets::Column::ErrorMessage,
            Expr::value(message.map(str::to_string)),
        )
        .col_expr(datasets::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(datasets::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;
    Ok(())
}

/// Returns the attempt count after incrementing.
pub async fn increment_conversion_attempts(
    db: &DatabaseConnection,
    uuid: &str,
) -> Result<i32, anyhow::Error> {
    Datasets::update_many()
        .col_expr(
            datasets::Column::ConversionAttempts,
            Expr::col(datasets::Column::ConversionAttempts).add(1),
        )
        .filter(datasets::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;

    let dataset = get_by_uuid(db, uuid)
        .await?
        .ok_or_else(|| anyhow!("dataset not found: {uuid}"))?;
    Ok(dataset.conversion_attempts)
}

pub async fn reset_conversion_attempts(db: &DatabaseConnection, uuid: &str) -> Result<(), DbErr> {
    Datasets::update_many()
        .col_expr(datasets::Column::ConversionAttempts, Expr::value(0))
        .filter(datasets::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn record_conversion_duration(
    db: &DatabaseConnection,
    uuid: &str,
    duration_secs: i64,
) -> Result<(), DbErr> {
    Datasets::update_many()
        .col_expr(
            datasets::Column::ConversionDurationSecs,
            Expr::value(duration_secs),
        )
        .col_expr(datasets::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(datasets::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;
    Ok(())
}

/// Mark a dataset deleted. Reads stop returning it immediately; bytes on
/// disk are left for out-of-band cleanup. Returns how many rows matched
/// (0 when the dataset is gone already or the owner does not match).
pub async fn soft_delete(
    db: &DatabaseConnection,
    uuid: &str,
    owner_email: &str,
) -> Result<u64, DbErr> {
    let res = Datasets::update_many()
        .col_expr(datasets::Column::DeletedAt, Expr::value(Some(Utc::now())))
        .col_expr(datasets::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(datasets::Column::Uuid.eq(uuid))
        .filter(datasets::Column::OwnerEmail.eq(owner_email))
        .filter(datasets::Column::DeletedAt.is_null())
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

pub async fn set_remote_source(
    db: &DatabaseConnection,
    uuid: &str,
    source: serde_json::Value,
) -> Result<(), DbErr> {
    Datasets::update_many()
        .col_expr(datasets::Column::RemoteSource, Expr::value(source))
        .filter(datasets::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn set_cancel_requested(
    db: &DatabaseConnection,
    uuid: &str,
    requested: bool,
) -> Result<(), DbErr> {
    Datasets::update_many()
        .col_expr(datasets::Column::CancelRequested, Expr::value(requested))
        .filter(datasets::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn set_data_size_gb(
    db: &DatabaseConnection,
    uuid: &str,
    size_gb: f64,
) -> Result<(), DbErr> {
    Datasets::update_many()
        .col_expr(datasets::Column::DataSizeGb, Expr::value(size_gb))
        .filter(datasets::Column::Uuid.eq(uuid))
        .exec(db)
        .await?;
    Ok(())
}

/// Completed datasets that never had their size reconciled.
pub async fn find_unsized_done(
    db: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<datasets::Model>, DbErr> {
    Datasets::find()
        .filter(datasets::Column::Status.eq(DatasetStatus::Done.as_str()))
        .filter(datasets::Column::DataSizeGb.is_null())
        .filter(not_deleted())
        .limit(limit)
        .all(db)
        .await
}

pub async fn list_by_owner(
    db: &DatabaseConnection,
    owner_email: &str,
    status: Option<DatasetStatus>,
    limit: u64,
    offset: u64,
) -> Result<Vec<datasets::Model>, DbErr> {
    let mut query = Datasets::find()
        .filter(datasets::Column::OwnerEmail.eq(owner_email))
        .filter(not_deleted());

    if let Some(status) = status {
        query = query.filter(datasets::Column::Status.eq(status.as_str()));
    }

    query
        .order_by_desc(datasets::Column::UpdatedAt)
        .limit(limit)
        .offset(offset)
        .all(db)
        .await
}

pub async fn count_by_status(
    db: &DatabaseConnection,
    status: DatasetStatus,
) -> Result<u64, DbErr> {
    Datasets::find()
        .filter(datasets::Column::Status.eq(status.as_str()))
        .filter(not_deleted())
        .count(db)
        .await
}
