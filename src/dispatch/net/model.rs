use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::{error::Error, wire::ModelUpload};
use crate::dispatch::task::{Outcome, Task};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A simulation model installed on a worker. It decodes one task, runs it
/// and encodes the value it produced.
pub trait Model: Send + Sync + 'static {
    fn run(&self, task: &[u8]) -> Result<Outcome<Vec<u8>>, BoxError>;
}

/// Turns uploaded model bytes into a runnable model. Workers cannot load
/// code, so the bytes are whatever the resolver understands, typically the
/// parameters of a model compiled into the worker binary.
pub trait ModelResolver: Send + Sync + 'static {
    fn resolve(&self, model_id: &str, bytecode: &[u8]) -> Result<Arc<dyn Model>, BoxError>;
}

/// The master-side counterpart of a [`Model`]: encodes tasks for the wire
/// and decodes the values workers send back.
pub trait TaskCodec<T: Task>: Send + Sync + 'static {
    fn encode_task(&self, task: &T) -> Result<Vec<u8>, BoxError>;

    fn decode_output(&self, payload: &[u8]) -> Result<T::Output, BoxError>;
}

/// Installed models of one worker, keyed by model id.
pub struct ModelLoader {
    resolver: Arc<dyn ModelResolver>,
    installed: RwLock<HashMap<String, Arc<dyn Model>>>,
}

impl ModelLoader {
    pub fn new(resolver: Arc<dyn ModelResolver>) -> Self {
        Self {
            resolver,
            installed: RwLock::new(HashMap::new()),
        }
    }

    /// Verifies and resolves an upload, replacing any model installed under
    /// the same id.
    pub async fn install(&self, upload: &ModelUpload) -> Result<(), Error> {
        if !upload.verify() {
            Err(Error::DigestMismatch(upload.model_id.clone()))?
        }
        let model = self
            .resolver
            .resolve(&upload.model_id, &upload.bytecode)
            .map_err(|e| Error::ModelInstall {
                model_id: upload.model_id.clone(),
                reason: e.to_string(),
            })?;
        self.installed
            .write()
            .await
            .insert(upload.model_id.clone(), model);
        debug!(model = %upload.model_id, digest = %upload.digest(), "installed model");
        Ok(())
    }

    /// Returns whether a model was installed under `model_id`.
    pub async fn uninstall(&self, model_id: &str) -> bool {
        let removed = self.installed.write().await.remove(model_id).is_some();
        if removed {
            debug!(model = %model_id, "uninstalled model");
        }
        removed
    }

    pub async fn get(&self, model_id: &str) -> Result<Arc<dyn Model>, Error> {
        self.installed
            .read()
            .await
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(model_id.to_owned()))
    }

    pub async fn len(&self) -> usize {
        self.installed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
