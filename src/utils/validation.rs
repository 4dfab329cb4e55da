use serde::Serialize;
use utoipa::ToSchema;
use validator::ValidationError;

/// Upload limits and accepted vocabularies, surfaced to clients.
#[derive(Serialize, ToSchema)]
pub struct UploadLimits {
    pub max_file_size: u64,
    pub single_upload_limit: u64,
    pub chunk_size: u64,
    pub sensors: Vec<&'static str>,
    pub download_scopes: Vec<&'static str>,
}

pub fn validate_sensor(value: &str) -> Result<(), ValidationError> {
    if crate::entities::datasets::SensorKind::parse(value).is_some() {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_sensor"))
    }
}

pub fn validate_download_scope(value: &str) -> Result<(), ValidationError> {
    if crate::entities::datasets::DownloadScope::parse(value).is_some() {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_download_scope"))
    }
}

pub fn validate_sha256_hex(value: &str) -> Result<(), ValidationError> {
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ValidationError::new("not_sha256_hex"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_names_validate() {
        assert!(validate_sensor("TIFF").is_ok());
        assert!(validate_sensor("4D_NEXUS").is_ok());
        assert!(validate_sensor("tiff").is_err());
    }

    #[test]
    fn sha256_shape() {
        assert!(validate_sha256_hex(&"a".repeat(64)).is_ok());
        assert!(validate_sha256_hex("deadbeef").is_err());
        assert!(validate_sha256_hex(&"z".repeat(64)).is_err());
    }
}
