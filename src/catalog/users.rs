use crate::entities::{prelude::*, users};
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
};
use uuid::Uuid;

pub async fn find_by_email<C: ConnectionTrait>(
    db: &C,
    email: &str,
) -> Result<Option<users::Model>, DbErr> {
    Users::find()
        .filter(users::Column::Email.eq(email))
        .one(db)
        .await
}

pub async fn find_by_id<C: ConnectionTrait>(
    db: &C,
    id: &str,
) -> Result<Option<users::Model>, DbErr> {
    Users::find_by_id(id).one(db).await
}

/// Look up a profile by email, creating it on first login.
pub async fn find_or_create<C: ConnectionTrait>(
    db: &C,
    email: &str,
    name: Option<&str>,
) -> Result<users::Model, DbErr> {
    if let Some(existing) = find_by_email(db, email).await? {
        return Ok(existing);
    }

    let user = users::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        email: Set(email.to_string()),
        name: Set(name.map(|s| s.to_string())),
        team_id: Set(None),
        is_active: Set(true),
        email_verified: Set(false),
        created_at: Set(Utc::now()),
        last_login: Set(None),
        last_activity: Set(None),
    };

    match user.insert(db).await {
        Ok(model) => Ok(model),
        // Two first logins can race on the unique email index; the loser
        // reads the winner's row.
        Err(e) => match find_by_email(db, email).await? {
            Some(existing) => Ok(existing),
            None => Err(e),
        },
    }
}

pub async fn touch_login<C: ConnectionTrait>(db: &C, user: &users::Model) -> Result<(), DbErr> {
    let mut active: users::ActiveModel = user.clone().into();
    active.last_login = Set(Some(Utc::now()));
    active.last_activity = Set(Some(Utc::now()));
    active.update(db).await?;
    Ok(())
}

pub async fn touch_activity<C: ConnectionTrait>(db: &C, user_id: &str) -> Result<(), DbErr> {
    Users::update_many()
        .col_expr(
            users::Column::LastActivity,
            sea_orm::sea_query::Expr::value(Utc::now()),
        )
        .filter(users::Column::Id.eq(user_id))
        .exec(db)
        .await?;
    Ok(())
}
