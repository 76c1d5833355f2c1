//! Frames of the rendezvous protocol.
//!
//! - **Topic constants** (`topics`): one topic per frame kind
//! - **Payloads** (`protocol`): the typed body carried by each topic

pub mod protocol;
pub mod topics;

pub use protocol::*;
