//! Provider integration layer.
//!
//! Everything that touches the chat-completions endpoint lives here:
//!
//! - [`request`] -- Endpoint, headers and JSON body construction.
//! - [`frames`] -- Line buffering and `data:` frame decoding.
//! - [`processor`] -- One streaming exchange per query, with reconnection.

pub mod frames;
pub mod processor;
pub mod request;

pub use frames::{Frame, LineBuffer, decode_line};
pub use processor::{RetryPolicy, StreamJob, StreamProcessor};
pub use request::RequestTemplate;
