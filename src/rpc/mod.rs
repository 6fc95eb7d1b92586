pub mod peer;
pub mod proto;
pub mod wire;

pub use peer::{login, Peer};
pub use wire::{Envelope, SessionRole};
