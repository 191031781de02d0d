use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use super::Error;
use crate::serde::{Deserializer, Serializer};

/// A JSON serialization and deserialization module.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(PhantomData<T>);

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for Json<T>
where
    T: Serialize,
{
    /// Serializes the given value to JSON format and returns the serialized bytes.
    ///
    /// Field order follows the declaration order of `T`, so equal values always
    /// produce identical bytes.
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization(Box::new(e)))
    }
}

impl<T> Deserializer<T> for Json<T>
where
    for<'d> T: Deserialize<'d>,
{
    /// Deserializes the given JSON bytes to produce a value of type `T`.
    fn deserialize(&self, data: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(data).map_err(|e| Error::Deserialization(Box::new(e)))
    }
}
