pub mod converters;
pub mod dispatcher;
pub mod identifier;
pub mod ingest;
pub mod remote;
pub mod token_service;
pub mod upload_session;
