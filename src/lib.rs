pub mod agents;
pub mod config;
pub mod errors;
pub mod executor;
pub mod models;
pub mod review;
pub mod sandbox;
pub mod store;
pub mod workflow;
