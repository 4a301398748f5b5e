//! Action tracing and stack orchestration toolkit.
//!
//! Two cores share this crate. The tracing pipeline captures semantically
//! typed actions at an HTTP middleware boundary, samples them per workflow,
//! and exports metadata to a SQL store and payloads to an object store, with
//! GDPR erasure, pseudonymization, export, and retention built in. The stack
//! orchestrator parses declarative JSON-LD stack definitions and starts
//! containers in position order behind health checks and post-start actions,
//! through an ephemeral test driver or a persistent production driver.
//!
//! Storage and the container runtime are injected through capability traits
//! (`store::TraceStore`, `store::ObjectStore`, `runtime::ContainerApi`);
//! Postgres, S3, and Docker implementations ship alongside in-memory fakes.

pub mod config;
pub mod context;
pub mod driver;
pub mod exporter;
pub mod extractor;
pub mod gdpr;
pub mod metrics;
pub mod middleware;
pub mod object_store;
pub mod pii;
pub mod postgres;
pub mod probe;
pub mod record;
pub mod runtime;
pub mod sampler;
pub mod scheduler;
pub mod stack;
pub mod store;
