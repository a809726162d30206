// Library root: exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod aggregation;
pub mod api;
pub mod cache;
pub mod calendar;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod remote;
pub mod repository;
pub mod runtime;
pub mod scheduler;
pub mod sync;

// These modules are only needed by the binary.
// Declared pub so integration tests can reach them if needed, but they
// contain no logic of interest to tests.
pub mod cli;
pub mod config;
pub mod logging;
