pub mod actions;
pub mod approvals;
pub mod audit;
pub mod auth;
pub mod clients;
pub mod config;
pub mod control_tools;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod policy;
pub mod run_context;
pub mod runs;
pub mod secret_sync;
pub mod state;
pub mod token;
pub mod tools;
