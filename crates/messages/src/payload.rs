use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed message payload carried by the bus.
///
/// Payloads are:
/// - **immutable** once published (the message row is never updated)
/// - identified by a stable `MESSAGE_TYPE` name that is registered in the
///   `message_type` catalog and used to route deliveries to handlers
pub trait MessagePayload:
    Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static
{
    /// Stable logical type name (e.g. "orders.order-placed").
    const MESSAGE_TYPE: &'static str;
}
