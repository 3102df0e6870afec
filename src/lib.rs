pub mod config;
pub mod solar;
