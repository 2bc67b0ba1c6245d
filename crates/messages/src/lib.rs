//! Message payloads, pluggable serialization and typed handler dispatch.

pub mod envelope;
pub mod handler;
pub mod payload;
pub mod registry;
pub mod serializer;

pub use envelope::{MessageEnvelope, RawDelivery};
pub use handler::{HandlerResult, MessageHandler};
pub use payload::MessagePayload;
pub use registry::{DispatchError, HandlerRegistry, RegistryError};
pub use serializer::{JsonSerializer, PayloadSerializer, SerializerError, decode, encode};
