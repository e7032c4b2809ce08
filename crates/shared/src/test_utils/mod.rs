pub mod helpers;
pub mod repository;

pub use repository::setup_in_memory_database;
