//! Utilities for testing code that is based on the relay: a [SessionHandler] that records
//!  everything it is called with, and a peer that talks the wire protocol frame by frame.
//!
//! They are part of the crate's regular (non-#[cfg(test)]) code so that integration tests and
//!  applications can use them.
//!
//! [SessionHandler]: crate::relay::handler::SessionHandler

pub mod handler;
pub mod wire;
