use crate::entities::{prelude::*, upload_sessions};
use crate::status::SessionState;
use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, TransactionTrait,
};

pub async fn get(
    db: &DatabaseConnection,
    session_id: &str,
) -> Result<Option<upload_sessions::Model>, DbErr> {
    UploadSessions::find_by_id(session_id).one(db).await
}

/// Fetch a session owned by the given user, or nothing.
pub async fn get_owned(
    db: &DatabaseConnection,
    session_id: &str,
    owner_email: &str,
) -> Result<Option<upload_sessions::Model>, DbErr> {
    UploadSessions::find_by_id(session_id)
        .filter(upload_sessions::Column::OwnerEmail.eq(owner_email))
        .one(db)
        .await
}

pub async fn insert(
    db: &DatabaseConnection,
    model: upload_sessions::ActiveModel,
) -> Result<upload_sessions::Model, DbErr> {
    model.insert(db).await
}

/// Record a chunk as received. Runs in a transaction with a row lock so
/// concurrent chunk uploads for the same session do not drop updates.
pub async fn mark_chunk_received(
    db: &DatabaseConnection,
    session_id: &str,
    chunk_index: i32,
) -> Result<usize, anyhow::Error> {
    let txn = db.begin().await?;

    let session = UploadSessions::find_by_id(session_id)
        .lock_exclusive()
        .one(&txn)
        .await?
        .ok_or_else(|| anyhow!("upload session not found: {session_id}"))?;

    let mut received: Vec<i32> = serde_json::from_value(session.received_chunks.clone())?;
    if !received.contains(&chunk_index) {
        received.push(chunk_index);
        received.sort_unstable();
    }
    let count = received.len();

    let mut active: upload_sessions::ActiveModel = session.into();
    active.received_chunks = Set(serde_json::json!(received));
    active.update(&txn).await?;

    txn.commit().await?;
    Ok(count)
}

/// Atomic state transition; the open -> completing edge is what prevents
/// two callers from assembling the same session.
pub async fn compare_and_set_state(
    db: &DatabaseConnection,
    session_id: &str,
    from: SessionState,
    to: SessionState,
) -> Result<bool, DbErr> {
    let res = UploadSessions::update_many()
        .col_expr(upload_sessions::Column::State, Expr::value(to.as_str()))
        .filter(upload_sessions::Column::Id.eq(session_id))
        .filter(upload_sessions::Column::State.eq(from.as_str()))
        .exec(db)
        .await?;
    Ok(res.rows_affected == 1)
}

pub async fn set_state(
    db: &DatabaseConnection,
    session_id: &str,
    to: SessionState,
) -> Result<(), DbErr> {
    UploadSessions::update_many()
        .col_expr(upload_sessions::Column::State, Expr::value(to.as_str()))
        .filter(upload_sessions::Column::Id.eq(session_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Open sessions whose deadline has passed, for the GC sweep.
pub async fn find_overdue_open(
    db: &DatabaseConnection,
    limit: u64,
) -> Result<Vec<upload_sessions::Model>, DbErr> {
    UploadSessions::find()
        .filter(upload_sessions::Column::State.eq(SessionState::Open.as_str()))
        .filter(upload_sessions::Column::ExpiresAt.lt(Utc::now()))
        .limit(limit)
        .all(db)
        .await
}

pub async fn list_by_owner(
    db: &DatabaseConnection,
    owner_email: &str,
    limit: u64,
    offset: u64,
) -> Result<Vec<upload_sessions::Model>, DbErr> {
    UploadSessions::find()
        .filter(upload_sessions::Column::OwnerEmail.eq(owner_email))
        .order_by_desc(upload_sessions::Column::CreatedAt)
        .limit(limit)
        .offset(offset)
        .all(db)
        .await
}
