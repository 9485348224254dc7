//! # crowdsched
//!
//! Task distribution for crowdsourcing: hands tasks to many concurrent
//! contributors exactly as often as each task's redundancy requires.
//!
//! Provides policy-driven scheduling, TTL reservations over a lock store,
//! answer-count-derived completion tracking, and size-based routing of bulk
//! mutations between inline execution and a pgmq worker queue. Postgres and
//! in-memory adapters are included, with OpenTelemetry observability.

pub mod bulk;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod lock;
pub mod model;
pub mod queue;
pub mod repo;
pub mod router;
pub mod sched;
pub mod service;
pub mod telemetry;
pub mod tracker;
pub mod worker;
