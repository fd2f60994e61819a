//! Rust client for streaming application events from the Airship Events API.
//!
//! The crate is organized by transport surface:
//! - `client`: authenticated HTTP client that owns the `307` + cookie
//!   redirect loop the API requires.
//! - `events`: request model, typed events, and the streaming response.

/// Authenticated API client.
pub mod client;
/// Events API request, event, and streaming response types.
pub mod events;

pub use client::{Client, ClientError, ClientOptions, Credentials};
