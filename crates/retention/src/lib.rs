pub mod logic;
pub mod repository;

pub use logic::lifecycle::{
    CleanupReport, DeletionLifecycle, DeletionNotice, LifecycleSettings, LogNoticeSender,
    NoticeSenderLike,
};
pub use logic::policy::{
    RetentionDecision, RetentionPolicy, evaluate, upsert_policy, validate_retention_period,
};
pub use logic::scheduler::{CleanupScheduler, cleanup_scheduler_task};
