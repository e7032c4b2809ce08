pub mod config;
pub mod service;

pub use config::DataguardConfig;
pub use service::{DataProtectionService, build_data_protection_service, start_cleanup_subsystem};
