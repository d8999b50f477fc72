//! `labmesh-middleware` – the transport underneath every worker.
//!
//! Two independent channels per worker, both plain TCP carrying one JSON
//! document per line:
//!
//! - **request/reply** – [`ReplyServer`] on the worker side hands each
//!   incoming line to the owning event loop and writes back exactly one
//!   reply; [`RequestChannel`] on the client side sends one request at a time
//!   and blocks (bounded) for the answer.
//! - **publish** – [`Publisher`] fans every envelope out to all connected
//!   subscribers through a Tokio broadcast channel; [`Subscriber`] is the
//!   client-side thread that reads the feed and filters by topic.
//!
//! The worker side is async (it lives inside the worker's event loop), the
//! client side is blocking so GUI and scripting callers can use it without a
//! runtime.

pub mod codec;
pub mod publisher;
pub mod reply_server;
pub mod request;
pub mod subscriber;

pub use publisher::Publisher;
pub use reply_server::{IncomingRequest, ReplyServer};
pub use request::RequestChannel;
pub use subscriber::Subscriber;
