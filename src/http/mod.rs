//! Long-running HTTP task client
//!
//! Shared by the session connector and the render grid: bounded retries for
//! network failures, an unbounded 503 backoff schedule, the 202/Location
//! polling protocol and binary framing for match payloads with images.

pub mod backoff;
pub mod client;
pub mod error;
pub mod framing;

pub use backoff::{ConcurrencyBackoff, PollDelay, RetryPolicy};
pub use client::{
    ClientConfig, EYES_DATE_HEADER, EYES_EXPECT_HEADER, EYES_EXPECT_VALUE, HttpRequest,
    HttpResponse, LongRunningHttpClient, RequestBody,
};
pub use error::{HttpError, Result};
