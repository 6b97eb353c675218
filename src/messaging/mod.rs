pub mod ack_tracker;
pub mod frame;
pub mod message;
pub mod peer_id;
