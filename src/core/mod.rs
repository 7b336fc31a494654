pub mod config;
pub mod dataset;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod selection;
pub mod stopping;
pub mod store;
pub mod terminal;
