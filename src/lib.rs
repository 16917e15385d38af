//! Headless-browser dashboard streaming: drives a browser to render a page,
//! diffs successive frames into JPEG tiles, and paces delivery of those tiles
//! to embedded display clients over WebSocket.
//!
//! [`registry::ServerState`] is the top-level owner; [`session::DeviceSession`]
//! (spawned via [`session::spawn_session`]) runs the per-device pipeline;
//! [`broadcaster::Broadcaster`] paces delivery to connected clients.

pub mod broadcaster;
pub mod browser;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod hash;
pub mod processing;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
