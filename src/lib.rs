//! Bulk HTTP request engine.
//!
//! Hand the engine an ordered [`Batch`] of requests and it fires them concurrently against an
//! injected [`HttpClient`], enforces one deadline across the whole batch, and returns one
//! response-or-error per request, aligned with the input order regardless of completion order.
//!
//! Internally each execution runs a small pipeline of worker pools: a publisher feeds requests
//! to the fire stage, which calls the transport; the process stage buffers each response body
//! and detaches it from the deadline; a collector gathers results until all are in or the
//! deadline expires. Anything still unresolved at that point is reported as
//! [`BroadsideError::RequestIgnored`].

pub mod batch;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod http;

// Re-export commonly used types
pub use batch::{Batch, BatchSummary};
pub use deadline::Deadline;
pub use engine::{BulkClient, BulkConfig, RunId};
pub use error::{BroadsideError, ErrorKind, Result};
pub use http::{
    Body, HttpClient, HttpRequest, HttpResponse, MockHttpClient, MockOutcome, RawResponse,
    ReqwestHttpClient,
};
