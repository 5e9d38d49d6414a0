//! SQLite schema and migrations for the server-of-record

pub mod init;
pub mod migrations;

pub use init::*;
pub use migrations::*;
