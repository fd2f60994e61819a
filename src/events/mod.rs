//! Events API modules.
//!
//! - `request`: request model and validation.
//! - `event`: event envelope and typed per-kind bodies.
//! - `response`: streaming NDJSON decoder and consumer handles.
//! - `fetch`: entry points that validate, POST and wrap the stream.

/// Event envelope and typed bodies.
pub mod event;
/// Fetch entry points and the transport seam.
pub mod fetch;
/// Request model sent to the events endpoint.
pub mod request;
/// Streaming response and its background decoder.
pub mod response;

pub use event::{BodyError, Event, EventType};
pub use fetch::{
    fetch, fetch_from_latest, fetch_from_offset, fetch_from_start, fetch_request, FetchError,
    Transport,
};
pub use request::{Filter, Request, RequestError, Start, Subset};
pub use response::{Events, Response, StreamError};
