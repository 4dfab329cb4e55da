pub use super::datasets::Entity as Datasets;
pub use super::tokens::Entity as Tokens;
pub use super::upload_sessions::Entity as UploadSessions;
pub use super::users::Entity as Users;
