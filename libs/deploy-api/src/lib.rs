//! Wire models for the deploy service HTTP API

pub mod models;

pub use models::*;
