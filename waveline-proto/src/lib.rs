//! Shared protocol definitions for the Waveline push channel wire format.

pub mod codec;
pub mod frame;
pub mod message;
