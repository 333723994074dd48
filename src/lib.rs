//! Library surface for the compression tasker, split out from `main.rs`
//! so integration tests can exercise the repository and evaluator
//! directly against a real database.

pub mod admin_seeder;
pub mod config;
pub mod db;
pub mod evaluator;
pub mod llm;
pub mod prelude;
pub mod repository;
pub mod retry;
pub mod tasker;
