//! ObjectStoreDeleter - `object_store` バックエンドでの削除
//!
//! Objects live at `<prefix>/<object id>`. Any backend `object_store` can
//! open from a URL works: `s3://bucket/prefix`, `gs://…`, `az://…`,
//! `file:///srv/media`, `memory://`.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path;
use object_store::ObjectStore;
use url::Url;

use crate::domain::{DeleteError, ObjectId};
use crate::ports::ObjectDeleter;

pub struct ObjectStoreDeleter {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectStoreDeleter {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: Path) -> Self {
        Self { store, prefix }
    }

    /// Open the backend named by `url`. Credentials and region come from the
    /// usual provider environment variables (`AWS_*`, `GOOGLE_*`, `AZURE_*`).
    pub fn from_url(url: &Url) -> Result<Self, object_store::Error> {
        let (store, prefix) = object_store::parse_url_opts(url, std::env::vars())?;
        tracing::debug!(%url, prefix = %prefix, "object store opened");
        Ok(Self::new(Arc::from(store), prefix))
    }

    /// Location of `id` inside the store.
    pub fn location(&self, id: &ObjectId) -> Result<Path, DeleteError> {
        let relative = Path::parse(id.as_str()).map_err(|e| DeleteError::InvalidLocation {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.prefix.parts().chain(relative.parts()).collect())
    }
}

#[async_trait]
impl ObjectDeleter for ObjectStoreDeleter {
    async fn delete_object(&self, id: &ObjectId) -> Result<(), DeleteError> {
        let location = self.location(id)?;
        match self.store.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                tracing::debug!(object = %id, %location, "object already gone");
                Ok(())
            }
            Err(e) => Err(DeleteError::Remote {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}
