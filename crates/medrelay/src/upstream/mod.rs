//! Upstream provider plumbing: HTTP client, SSE decoding, event
//! normalization and the retry controller

pub mod client;
pub mod normalize;
pub mod retry;
pub mod sse;

pub use client::{CozeClient, TenantSettings, UpstreamFrames};
pub use normalize::EventNormalizer;
pub use retry::RetryPolicy;
pub use sse::{SseDecoder, SseFrame};
