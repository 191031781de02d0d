//! # Envelope Value Serialization Deserialization Library
//!
//! This library provides traits and implementations for turning the payloads carried by
//! Cartflow envelopes into bytes and back. It includes implementations for JSON and MessagePack.
pub mod serde;
pub use crate::serde::{Deserializer, Error, Serde, Serializer};
