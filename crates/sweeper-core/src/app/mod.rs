//! App - アプリケーション層
//!
//! ports を組み合わせて、接続管理・送信・消費ループを実装します。
//!
//! # 主要コンポーネント
//! - **ClientBuilder**: 設定の検証と接続
//! - **Client**: 接続の管理（再接続、アイドル解放、close）
//! - **Publisher**: `Client::publish` / `Client::start_consumer`
//! - **DeleteWorker**: 削除キューの消費ループ

pub mod builder;
pub mod connection;
mod idle_monitor;
pub mod publisher;
pub mod worker_loop;

pub use self::builder::{ClientBuilder, ClientConfig};
pub use self::connection::Client;
pub use self::worker_loop::{DeleteWorker, WorkerConfig, WorkerHandle, delete_with_retry};
