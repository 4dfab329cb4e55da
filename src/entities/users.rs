use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A user profile, created lazily on first successful login.
///
/// Profiles are never deleted; deactivation flips `is_active`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_profiles")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub email: String,
    pub name: Option<String>,
    pub team_id: Option<String>,
    pub is_active: bool,
    pub email_verified: bool,
    pub created_at: DateTimeUtc,
    pub last_login: Option<DateTimeUtc>,
    pub last_activity: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::tokens::Entity")]
    Tokens,
    #[sea_orm(has_many = "super::datasets::Entity")]
    Datasets,
}

impl Related<super::tokens::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tokens.def()
    }
}

impl Related<super::datasets::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Datasets.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
