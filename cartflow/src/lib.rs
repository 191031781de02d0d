#![doc = include_str!("../README.md")]

mod consumer;
mod coordinator;
mod envelope;
mod model;
mod publisher;
mod sink;
pub mod testing;
mod transport;
mod utils;
mod validator;

#[doc(inline)]
pub use crate::consumer::{
    decode_cart_update, ConsumeError, EnvelopeListener, VersionError, VersionGate,
};
#[doc(inline)]
pub use crate::coordinator::{CoordinatorConfig, Error as CoordinatorError, UpdateCoordinator};
#[doc(inline)]
pub use crate::envelope::{DeliveredEnvelope, Envelope, Header, DEFAULT_TYPE_ID, TYPE_ID_HEADER};
#[doc(inline)]
pub use crate::model::{ActionKind, CartEntry, CartUpdateRequest, EntryOutcome, MutationAction};
#[doc(inline)]
pub use crate::publisher::{BatchPublisher, Error as PublishError, PublisherConfig};
#[doc(inline)]
pub use crate::sink::{
    BufferedSink, BufferedSinkConfig, DirectSink, EventSink, SinkClosed, VersionSequencer,
};
#[doc(inline)]
pub use crate::transport::{HashPartitioner, InMemoryTransport, Partitioner, Transport};
#[doc(inline)]
pub use crate::validator::{
    KnownCartsValidator, StructuralValidator, ValidationError, Validator,
};

pub type BoxDynError = Box<dyn std::error::Error + 'static + Send + Sync>;

pub mod serde {
    //! # Cart Update Serialization Deserialization.
    #[cfg(feature = "serde-json")]
    #[doc(inline)]
    pub use cartflow_serde::serde::json;
    #[cfg(feature = "serde-messagepack")]
    #[doc(inline)]
    pub use cartflow_serde::serde::messagepack;
    #[doc(inline)]
    pub use cartflow_serde::{Deserializer, Error, Serde, Serializer};
}
