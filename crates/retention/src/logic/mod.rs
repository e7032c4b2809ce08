pub mod lifecycle;
pub mod policy;
pub mod scheduler;
