use crate::entities::{prelude::*, tokens};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
};
use uuid::Uuid;

pub async fn insert<C: ConnectionTrait>(
    db: &C,
    user_id: &str,
    kind: &str,
    token_hash: &str,
    expires_at: chrono::DateTime<Utc>,
) -> Result<tokens::Model, DbErr> {
    tokens::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        user_id: Set(user_id.to_string()),
        kind: Set(kind.to_string()),
        token_hash: Set(token_hash.to_string()),
        created_at: Set(Utc::now()),
        expires_at: Set(expires_at),
        is_revoked: Set(false),
        last_used: Set(None),
    }
    .insert(db)
    .await
}

pub async fn find_by_hash<C: ConnectionTrait>(
    db: &C,
    token_hash: &str,
) -> Result<Option<tokens::Model>, DbErr> {
    Tokens::find()
        .filter(tokens::Column::TokenHash.eq(token_hash))
        .one(db)
        .await
}

pub async fn revoke_by_hash<C: ConnectionTrait>(db: &C, token_hash: &str) -> Result<u64, DbErr> {
    let res = Tokens::update_many()
        .col_expr(tokens::Column::IsRevoked, Expr::value(true))
        .filter(tokens::Column::TokenHash.eq(token_hash))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}

pub async fn touch_last_used<C: ConnectionTrait>(db: &C, token_id: &str) -> Result<(), DbErr> {
    Tokens::update_many()
        .col_expr(tokens::Column::LastUsed, Expr::value(Utc::now()))
        .filter(tokens::Column::Id.eq(token_id))
        .exec(db)
        .await?;
    Ok(())
}

/// Drop descriptors whose expiry is long past. Revoked rows are kept until
/// expiry so revocation stays observable.
pub async fn purge_expired<C: ConnectionTrait>(db: &C) -> Result<u64, DbErr> {
    let res = Tokens::delete_many()
        .filter(tokens::Column::ExpiresAt.lt(Utc::now()))
        .exec(db)
        .await?;
    Ok(res.rows_affected)
}
