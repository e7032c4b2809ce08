pub mod field;
pub mod key_service;
pub mod search;
