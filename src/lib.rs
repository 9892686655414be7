pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod notify;
pub mod routes;
pub mod state_store;
