//! WebSocket Call Handling
//!
//! This module bridges a caller's WebSocket to the remote inference stream.
//! It is structured into submodules:
//!
//! - `protocol`: The JSON message format between the client and the server.
//! - `session`: Connection lifecycle, from upgrade to teardown.
//! - `bridge`: The per-connection duplex bridge and its teardown path.
//! - `queue`: The bounded outbound frame queue feeding the remote stream.
//! - `transport`: Delivery of server messages to the client socket.
//! - `registry`: Live connections, for shutdown routing.

pub mod bridge;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod session;
pub mod transport;

pub use registry::ConnectionRegistry;
pub use session::ws_handler;
