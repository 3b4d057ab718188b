//! # Scope Bus Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── bus_benchmarks.rs   # Publish/deliver throughput
//! └── src/integration/
//!     ├── pubsub.rs           # Scoped delivery over every transport
//!     ├── rpc.rs              # Request/reply across buses
//!     └── pipeline.rs         # Ordering, isolation, converter precedence
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests integration::rpc::
//! cargo bench -p bus-tests
//! ```

#![allow(dead_code)]

pub mod integration;
