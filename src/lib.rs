pub mod app;
pub mod audit;
pub mod config;
pub mod cycle;
pub mod domain;
pub mod error;
pub mod gfs;
pub mod grid;
pub mod handoff;
pub mod output;
pub mod reconcile;
pub mod retriever;
pub mod scheduler;
pub mod store;
pub mod validator;
