//! Clients for the controller: the REST API and the persistent WebSocket.

pub mod http;
pub mod ws;

pub use http::ControllerClient;
pub use ws::{FrameSink, FrameStream, PushChannel};
