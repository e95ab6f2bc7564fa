pub mod aggregator;
pub mod classify;
pub mod config;
pub mod content;
pub mod handlers;
pub mod model;
pub mod monitor;
pub mod scheduler;
pub mod state;
pub mod transport;
