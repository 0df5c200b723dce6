pub mod cli;
pub mod message_tracing;
pub mod models;
pub mod providers;
pub mod server;
pub mod tools;
