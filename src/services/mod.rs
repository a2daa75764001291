//! Service layer module
//!
//! Contains the HTTP transport, streaming state machine, response cache,
//! usage accounting and the request router

pub mod cache;
pub mod router;
pub mod stream;
pub mod transport;
pub mod usage;

pub use cache::{CacheMode, CacheStore, ChatCache, JsonlCacheStore, MemoryCacheStore};
pub use router::Router;
pub use stream::{fold_stream, EventDecoder, PartialCallback, StreamEvent};
pub use transport::{HttpTransport, PreparedRequest, RetryConfig, SseEvent};
pub use usage::{estimate_cost, render_cost, GenerationStats};
