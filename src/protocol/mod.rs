//! The remote endpoint wire protocol: length-delimited
//! binary framing, the magic/version/initialize handshake, the
//! request/response taxonomy, and the codec that makes a remote endpoint
//! indistinguishable from a local one to the controller.

pub mod frame;
pub mod messages;
pub mod negotiation;
pub mod remote;

pub use frame::{read_frame, write_frame};
pub use messages::{EndpointRequest, InitializeRequest, InitializeResponse, CLIENT_MAGIC, PROTOCOL_VERSION, SERVER_MAGIC};
pub use negotiation::{client_handshake, server_handshake};
pub use remote::{serve_endpoint, RemoteEndpoint};

// vim: ts=4
