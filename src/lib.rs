pub mod agent;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod llm;
pub mod model;
pub mod multiplex;
pub mod oracle;
pub mod progress;
pub mod resolver;
pub mod server;
pub mod store;
pub mod streaming;
pub mod telemetry;
pub mod tools;
