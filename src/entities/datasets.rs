use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// The authoritative record for one dataset.
///
/// Four identifiers resolve to the same row: `uuid` (primary key), `name`
/// (unique per owner), `slug` (unique globally), and `numeric_id` (unique
/// globally). `files` is append-only until the dataset reaches a terminal
/// status.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "datasets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uuid: String,
    pub name: String,
    #[sea_orm(unique)]
    pub slug: String,
    #[sea_orm(unique)]
    pub numeric_id: i32,
    pub owner_email: String,
    pub team_id: Option<String>,
    pub sensor: String,
    pub convert: bool,
    pub is_public: bool,
    pub is_downloadable: String,
    pub status: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub files: Json,
    pub data_size_gb: Option<f64>,
    pub folder: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub tags: Json,
    pub description: Option<String>,
    pub error_message: Option<String>,
    /// Tagged source descriptor for remote-source ingests, consumed by the
    /// worker that executes the fetch.
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub remote_source: Option<Json>,
    pub conversion_attempts: i32,
    pub conversion_duration_secs: Option<i64>,
    pub claimed_at: Option<DateTimeUtc>,
    pub cancel_requested: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub deleted_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::OwnerEmail",
        to = "super::users::Column::Email",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    Users,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Users.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// One uploaded file inside a dataset, stored in the `files` JSON column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FileEntry {
    pub filename: String,
    pub size_bytes: i64,
    pub uploaded_at: chrono::DateTime<chrono::Utc>,
    /// Path relative to the dataset's upload directory.
    pub relative_path: String,
}

impl Model {
    pub fn file_entries(&self) -> Vec<FileEntry> {
        serde_json::from_value(self.files.clone()).unwrap_or_default()
    }

    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_value(self.tags.clone()).unwrap_or_default()
    }
}

/// Raw-format vocabulary. The sensor selects the conversion pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum SensorKind {
    #[serde(rename = "IDX")]
    Idx,
    #[serde(rename = "TIFF")]
    Tiff,
    #[serde(rename = "TIFF_RGB")]
    TiffRgb,
    #[serde(rename = "4D_NEXUS")]
    Nexus4d,
    #[serde(rename = "HDF5")]
    Hdf5,
    #[serde(rename = "NETCDF")]
    NetCdf,
    #[serde(rename = "RGB_DRONE")]
    RgbDrone,
    #[serde(rename = "MAPIR_DRONE")]
    MapirDrone,
    #[serde(rename = "OTHER")]
    Other,
}

impl SensorKind {
    pub const ALL: [SensorKind; 9] = [
        Self::Idx,
        Self::Tiff,
        Self::TiffRgb,
        Self::Nexus4d,
        Self::Hdf5,
        Self::NetCdf,
        Self::RgbDrone,
        Self::MapirDrone,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idx => "IDX",
            Self::Tiff => "TIFF",
            Self::TiffRgb => "TIFF_RGB",
            Self::Nexus4d => "4D_NEXUS",
            Self::Hdf5 => "HDF5",
            Self::NetCdf => "NETCDF",
            Self::RgbDrone => "RGB_DRONE",
            Self::MapirDrone => "MAPIR_DRONE",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may download the raw and converted artifacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DownloadScope {
    OnlyOwner,
    OnlyTeam,
    Public,
}

impl DownloadScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnlyOwner => "only_owner",
            Self::OnlyTeam => "only_team",
            Self::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "only_owner" => Self::OnlyOwner,
            "only_team" => Self::OnlyTeam,
            "public" => Self::Public,
            _ => return None,
        })
    }
}
