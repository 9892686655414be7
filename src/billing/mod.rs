pub mod adapters;
pub mod api;
pub mod evaluator;
pub mod ledger;
pub mod models;
pub mod orchestrator;
pub mod plans;
pub mod reconciliation;
pub mod scheduler;
pub mod service;
