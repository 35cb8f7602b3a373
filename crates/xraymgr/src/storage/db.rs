//! Database handle for the credential store.

pub use xraymgr_core::db::DatabaseError;

xraymgr_core::define_database!(Database, "Credential store migrations complete");
