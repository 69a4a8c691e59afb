//! ObjectDeleter port - リモートストレージ上のオブジェクト削除
//!
//! The delete call is opaque to the worker: it may fail for any reason and
//! is retried. Implementations must be idempotent, deleting an object that is
//! already gone is a success.

use async_trait::async_trait;

use crate::domain::{DeleteError, ObjectId};

#[async_trait]
pub trait ObjectDeleter: Send + Sync {
    async fn delete_object(&self, id: &ObjectId) -> Result<(), DeleteError>;
}
