//! Ports - 抽象化レイヤー
//!
//! Hexagonal "ports" for the two external systems the service touches:
//! the message broker and the object store.

pub mod broker;
pub mod object_store;

pub use self::broker::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerEndpoint, DeclaredQueue,
    DeliveryStream, QueueSpec,
};
pub use self::object_store::ObjectDeleter;
