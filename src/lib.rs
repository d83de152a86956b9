//! Faultline: asynchronous AI root-cause analysis for ingested error
//! events.
//!
//! The ingestion collaborator stores an event and calls
//! [`trigger::TriggerPolicy::on_error_stored`]; severe errors are queued
//! on the durable [`queue::TaskQueue`] and picked up by the
//! [`worker::WorkerPool`], which correlates the stack trace with source
//! fetched from the project's repository, invokes the analysis engine,
//! and persists one [`models::AnalysisRecord`] per event. The dashboard
//! collaborator polls [`db::PipelineDb::get_analysis`].

pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod queue;
pub mod source;
pub mod stacktrace;
pub mod trigger;
pub mod worker;
