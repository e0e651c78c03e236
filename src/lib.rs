//! # dips
//!
//! Distributed pipeline execution over an at-least-once message broker.
//!
//! Clients submit jobs (pipelines of stages and tasks) to a shared job
//! queue. Job workers run each pipeline in order, calling named task
//! services over a correlation-id RPC protocol. Task workers execute
//! requests in a sandboxed working directory and publish results. All
//! broker traffic goes through one connection [`mux::Multiplexer`] per
//! process, which buffers while the broker is away and redeclares queues on
//! reconnect.
//!
//! Transports: pgmq on Postgres, or an in-process broker for tests and
//! single-process runs.

pub mod broker;
pub mod config;
pub mod error;
pub mod eval;
pub mod event;
pub mod job;
pub mod model;
pub mod mux;
pub mod queues;
pub mod rpc;
pub mod sandbox;
pub mod service;
pub mod telemetry;
pub mod worker;
