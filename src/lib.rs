//! Asynchronous prediction job pipeline
//!
//! Clients submit feature payloads and get a job id back immediately. The
//! job is persisted as `Pending`, a reference is pushed onto an at-least-once
//! work queue, and a batching worker later resolves it to `Done` or `Failed`.
//! Clients poll the job id for the outcome.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
