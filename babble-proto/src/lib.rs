//! Shared protocol definitions for the babble wire format.

pub mod client;
pub mod codec;
pub mod event;
