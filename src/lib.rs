//! opstail: paginated, live-tailing cache over operation and message logs.

mod cli;
pub mod opstail_backend;
pub mod opstail_cache;
pub mod opstail_core;
pub mod opstail_demo;
pub mod opstail_http;
pub mod opstail_protocol;
pub mod opstail_stream;

pub use cli::{run, DynError};
