//! deployd library
//!
//! Deploy execution pipeline: a ledger of deploys and their ordered build
//! commands, an orchestrator that runs them through pluggable step executors,
//! and the HTTP service around it.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod ledger;
pub mod logs;
pub mod models;
pub mod server;
pub mod step;
pub mod storage;
pub mod utils;
pub mod workers;
