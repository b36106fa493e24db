//! # URL Fan-out
//!
//! An HTTP service that takes a batch of URLs, fetches every one of them
//! concurrently, decodes each response as a JSON todo record and answers
//! with all records, or with a single opaque failure when any fetch fails.
//!
//! Two independent concurrency ceilings keep the process bounded:
//!
//! | Ceiling | Default | Behaviour when full |
//! |---------|---------|---------------------|
//! | Admitted batches (process-wide) | 100 | new batch rejected with `429` |
//! | Fetches in flight (per batch) | 4 | further launches wait for a slot |
//!
//! A batch holds at most 20 URLs and every outbound fetch is bounded by a
//! 1 second timeout.
//!
//! ## Wire format
//!
//! ```text
//! POST /
//! {"urls": ["https://jsonplaceholder.typicode.com/todos/1"]}
//!
//! 200 OK
//! {"results": [{"url": "https://jsonplaceholder.typicode.com/todos/1",
//!               "userId": 1, "id": 1, "title": "...", "completed": false}]}
//! ```
//!
//! ## Library usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use url_fanout::{Dispatcher, HttpFetcher, LimitsSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let limits = LimitsSettings::default();
//!     let fetcher = HttpFetcher::new(limits.call_timeout)?;
//!     let dispatcher = Dispatcher::new(Arc::new(fetcher), &limits);
//!
//!     let batch = dispatcher
//!         .dispatch(
//!             &CancellationToken::new(),
//!             vec!["https://jsonplaceholder.typicode.com/todos/1".to_string()],
//!         )
//!         .await?;
//!     println!("fetched {} records", batch.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! url-fanout serve --address 0.0.0.0:8080
//! url-fanout fetch --input urls.txt
//! url-fanout validate --config config/config.yml
//! ```

/// Admission control for inbound batches
pub mod admission;

/// Command-line interface implementation
pub mod cli;

/// Configuration loading and validation
pub mod config;

/// Concurrent fan-out of one batch
pub mod dispatcher;

/// Error types and their HTTP mapping
pub mod error;

/// Outbound HTTP fetches
pub mod fetcher;

/// Health derived from admission pressure
pub mod health;

/// Metrics collection and Prometheus export
pub mod metrics;

/// Request and response envelopes
pub mod models;

/// HTTP routes and server lifecycle
pub mod server;

/// Utility functions and helpers
pub mod utils;


pub use self::admission::*;
pub use self::cli::*;
pub use self::config::*;
pub use self::dispatcher::*;
pub use self::error::*;
pub use self::fetcher::*;
pub use self::health::*;
pub use self::metrics::*;
pub use self::models::*;
pub use self::server::*;
pub use self::utils::*;
