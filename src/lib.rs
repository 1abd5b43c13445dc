pub mod client;
pub mod config;
pub mod coordinator;
pub mod models;
pub mod presence;
pub mod store;
pub mod transform;
pub mod ws;
