//! Out-of-process capability services over line-delimited JSON-RPC on stdio.
//!
//! The client side ([`StdioChannel`]) spawns a service process, performs the
//! handshake, lists operations and invokes them with per-call timeouts. The
//! server side ([`ServiceHost`]) lets a Rust binary expose operations with the
//! same protocol. Every reply is reduced to one canonical shape by
//! [`normalize`].

pub mod channel;
pub mod error;
pub mod host;
pub mod normalize;
pub mod protocol;

pub use channel::{CapabilityChannel, StdioChannel};
pub use error::TransportError;
pub use host::ServiceHost;
pub use normalize::normalize;
pub use protocol::{ContentItem, RawReply, ToolInfo};
