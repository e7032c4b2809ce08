pub mod event;
pub mod publisher;
