use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Server-side state for one resumable chunked upload.
///
/// `received_chunks` holds the set of 0-based chunk indices already written
/// to the spool; `chunk_hashes`, when declared at initiation, holds the
/// expected SHA-256 per index.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "upload_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub dataset_uuid: String,
    pub owner_email: String,
    pub filename: String,
    pub total_size: i64,
    pub chunk_size: i64,
    pub total_chunks: i32,
    #[sea_orm(column_type = "JsonBinary")]
    pub received_chunks: Json,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub chunk_hashes: Option<Json>,
    pub overall_hash: Option<String>,
    pub state: String,
    pub created_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::datasets::Entity",
        from = "Column::DatasetUuid",
        to = "super::datasets::Column::Uuid",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    Datasets,
}

impl Related<super::datasets::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Datasets.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn received_set(&self) -> Vec<i32> {
        serde_json::from_value(self.received_chunks.clone()).unwrap_or_default()
    }

    pub fn declared_chunk_hashes(&self) -> Option<Vec<String>> {
        self.chunk_hashes
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn missing_chunks(&self) -> Vec<i32> {
        let received = self.received_set();
        (0..self.total_chunks)
            .filter(|i| !received.contains(i))
            .collect()
    }
}
