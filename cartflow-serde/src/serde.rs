use std::error::Error as StdError;

#[cfg(feature = "json")]
pub mod json;
#[cfg(feature = "messagepack")]
pub mod messagepack;

/// Represents all the ways a codec can fail.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The value could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[source] Box<dyn StdError + Send + Sync>),
    /// The bytes could not be decoded into the target type.
    #[error("deserialization error: {0}")]
    Deserialization(#[source] Box<dyn StdError + Send + Sync>),
}

/// The `Serializer` trait defines the behavior for serializing values of type `T`.
///
/// Serialization is fallible: a value that cannot be represented in the target format
/// must be reported, never replaced by a partial or empty payload.
pub trait Serializer<T> {
    /// Serializes a value of type `T` into a byte vector.
    ///
    /// # Arguments
    ///
    /// * `value` - The value to be serialized.
    ///
    /// # Returns
    ///
    /// A `Result` containing the serialized bytes, or an error if the value cannot be encoded.
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Error>;
}

impl<T, F> Serializer<T> for F
where
    F: Fn(&T) -> Result<Vec<u8>, Error>,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Error> {
        self(value)
    }
}

/// The `Deserializer` trait defines the behavior for deserializing values of type `T`.
pub trait Deserializer<T> {
    /// Deserializes a byte slice into a value of type `T`.
    ///
    /// # Arguments
    ///
    /// * `data` - The bytes to be deserialized.
    ///
    /// # Returns
    ///
    /// A `Result` containing the deserialized value on success, or an error on failure.
    fn deserialize(&self, data: &[u8]) -> Result<T, Error>;
}

/// The `Serde` trait combines the `Serializer` and `Deserializer` traits for convenience.
pub trait Serde<T>: Serializer<T> + Deserializer<T> {}

impl<K, T> Serde<T> for K where K: Serializer<T> + Deserializer<T> {}
