//! HTTP surface of the server.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (router assembly, graceful shutdown)
//!     → request.rs (timer, root path, trace id, request log)
//!     → [module middlewares, then the route's handler or form pipeline]
//!     → response.rs (attachments, content sniffing)
//!     → error.rs (status and message for every failure)
//! ```

pub mod error;
pub mod request;
pub mod response;
pub mod server;

pub use error::ApiError;
pub use server::{HttpServer, ServerError};
