pub mod config;
pub mod realtime;
pub mod registry;
