pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod manager;
pub mod package;
pub mod platform;
pub mod registry;
pub mod store;
pub mod unpack;
