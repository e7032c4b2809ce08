pub mod env;
pub mod error;
pub mod libsql;
pub mod logging;
pub mod primitives;
pub mod subsystem;
pub mod test_utils;
