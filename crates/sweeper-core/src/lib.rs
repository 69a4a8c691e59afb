//! sweeper-core
//!
//! Resilient delete-queue client and worker.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ObjectId, Delivery, RetryPolicy, WorkerState, errors）
//! - **ports**: 抽象化レイヤー（BrokerConnector, BrokerChannel, ObjectDeleter）
//! - **impls**: 実装（AMQP, InMemoryBroker, object_store）
//! - **app**: アプリケーションロジック（Client, publisher, idle monitor, DeleteWorker）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use crate::app::{Client, ClientBuilder, DeleteWorker, WorkerConfig, WorkerHandle};
pub use crate::domain::{ClientError, ObjectId, RetryPolicy, WorkerState};
