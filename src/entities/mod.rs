pub mod prelude;

pub mod datasets;
pub mod tokens;
pub mod upload_sessions;
pub mod users;
