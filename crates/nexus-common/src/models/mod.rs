//! Wire models shared between the voice engine and anything that talks to the SFU.
//!
//! Field names follow the signaling protocol (camelCase on the wire).

pub mod presence;
pub mod voice;

pub use presence::*;
pub use voice::*;
