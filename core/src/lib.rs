//! Leaf components of the chatflow pipeline.
//!
//! Each module here is dependency-free with respect to the others:
//! [`buffer`] turns streamed text fragments into UI-sized flushes,
//! [`cache`] collapses concurrent identical upstream calls, and
//! [`quota`] gates access to expensive resources behind tier and daily-usage
//! checks. The engine crate wires them together.

pub mod buffer;
pub mod cache;
pub mod quota;

pub use buffer::ChunkBuffer;
pub use cache::RequestCache;
pub use quota::{AdmissionController, MemoryQuotaStore, QuotaRecord, QuotaStore, UsageStats};
