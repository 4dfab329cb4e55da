//! Repository layer over the catalog store.
//!
//! All database access goes through these modules. Status columns are only
//! ever written with compare-and-set updates so that racing writers
//! serialize on the stored value.

pub mod datasets;
pub mod sessions;
pub mod tokens;
pub mod users;
