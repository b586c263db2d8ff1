//! hogtail: extract metrics from log files
//!
//! Programs written in a small pattern/action language are compiled to
//! bytecode and run by a stack VM against every line read from the tailed
//! logs. The VM updates metrics in a shared [`store::Store`], which the
//! exporter pushes to collectd, graphite or statsd.
//!
//! # Architecture
//!
//! - **Compiler** ([`parser`]): lexer, parser, checker, optimiser and code
//!   generator producing a [`program::Object`]
//! - **VM** ([`executor`]): runs one object against one [`logline::LogLine`]
//! - **Tailer** ([`tailer`]): follows files, pipes, sockets and stdin
//! - **Runtime** ([`runtime`]): owns the loaded programs and fans lines out
//! - **Exporter** ([`exporter`]): periodic push of store snapshots
//!
//! # Example Usage
//!
//! ```
//! use hogtail::logline::LogLine;
//! use hogtail::runtime::{Runtime, RuntimeOptions};
//! use hogtail::store::Store;
//! use std::sync::Arc;
//!
//! let runtime = Runtime::new(Arc::new(Store::new()), RuntimeOptions::default());
//! runtime
//!     .load_source("count.mtail", "counter lines\n/$/ { lines++ }\n")
//!     .unwrap();
//! runtime.process_line(&LogLine::new("app.log", "hello"));
//!
//! let lines = runtime.store().find("lines", "count.mtail").unwrap();
//! assert_eq!(lines.get_datum(&[]).unwrap().get_int(), 1);
//! ```

// Compiler and VM
pub mod constant_pool;
pub mod executor;
pub mod opcodes;
pub mod parser;
pub mod program;
pub mod value;

// Metric storage and export
pub mod exporter;
pub mod store;

// Log input
pub mod logline;
pub mod tailer;
pub mod waker;

// Wiring
pub mod config;
pub mod error;
pub mod observability;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::Executor;
pub use logline::LogLine;
pub use opcodes::Opcode;
pub use program::Object;
pub use runtime::Runtime;
pub use server::Server;
pub use store::Store;
pub use value::Value;
