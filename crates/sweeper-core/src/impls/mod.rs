//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **AmqpConnector**: RabbitMQ などの AMQP 0-9-1 ブローカー
//! - **InMemoryBroker**: 開発・テスト用のブローカー（障害注入つき）
//! - **ObjectStoreDeleter**: `object_store` による削除

pub mod amqp;
pub mod inmem_broker;
pub mod object_store;

pub use self::amqp::AmqpConnector;
pub use self::inmem_broker::{BrokerStats, InMemoryBroker, QueueStats};
pub use self::object_store::ObjectStoreDeleter;
