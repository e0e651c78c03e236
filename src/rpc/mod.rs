//! Request/response calls to named task services over the multiplexer.
//!
//! Each service owns two logical queues: a shared request queue consumed
//! competitively by workers, and a shared result queue that callers
//! demultiplex by correlation id (the task id).

pub mod client;
pub mod server;

pub use client::{DispatchedTask, NewTaskRequest, RetryPolicy, TaskClient};
pub use server::{RequestHandler, RpcServer};
