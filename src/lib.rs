//! dbctl: back up, restore, migrate and run a PostgreSQL-backed application
//! across named environments.

pub mod core;
pub mod error;
pub mod utils;

pub use error::{DbctlError, ErrorKind};
