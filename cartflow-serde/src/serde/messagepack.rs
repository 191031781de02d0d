use std::marker::PhantomData;

use serde::Deserialize;
use serde::Serialize;

use super::Error;
use crate::serde::Deserializer;
use crate::serde::Serializer;

/// A struct to serialize and deserialize MessagePack payloads.
///
/// Structs are encoded as maps keyed by field name, so consumers written in other
/// languages can decode them without knowing the field order.
#[derive(Debug, Clone, Copy)]
pub struct MessagePack<T>(PhantomData<T>);

impl<T> Default for MessagePack<T> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for MessagePack<T>
where
    T: Serialize,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, Error> {
        rmp_serde::to_vec_named(value).map_err(|e| Error::Serialization(Box::new(e)))
    }
}

impl<T> Deserializer<T> for MessagePack<T>
where
    for<'d> T: Deserialize<'d>,
{
    fn deserialize(&self, data: &[u8]) -> Result<T, Error> {
        rmp_serde::from_slice(data).map_err(|e| Error::Deserialization(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Entry {
        product_id: String,
        qty_adjustment: i64,
    }

    #[test]
    fn it_serializes_and_deserializes_messagepack_data() {
        let msgpack = MessagePack::<Entry>::default();
        let entry = Entry {
            product_id: String::from("P001"),
            qty_adjustment: -2,
        };

        let bytes = msgpack.serialize(&entry).unwrap();
        assert_eq!(msgpack.deserialize(&bytes).unwrap(), entry);
    }

    #[test]
    fn it_reports_truncated_input() {
        let msgpack = MessagePack::<Entry>::default();
        let bytes = msgpack
            .serialize(&Entry {
                product_id: String::from("P001"),
                qty_adjustment: 1,
            })
            .unwrap();

        let err = msgpack.deserialize(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
