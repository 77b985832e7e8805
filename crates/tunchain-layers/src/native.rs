//! Native-library layers
//!
//! Engines linked in as native code (the QUIC accelerator, the traffic
//! shaper) expose a handle-based API: create returns an integer handle,
//! every other call takes it, and release frees it. [`NativeBackend`] is
//! that API; [`NativeLayer`] adapts it to [`LayerHandle`].
//!
//! Backend calls may block, so every one of them runs on tokio's
//! blocking pool. A call that uses or produces a handle owns the slot
//! lock for its whole duration and writes its result back itself:
//!
//! - a caller that stops waiting (a start timeout) cannot strand a
//!   freshly created handle, it still lands in its slot for `stop`
//! - `stop` cannot release an engine while another call is using it
//!
//! Handles are taken out of their slots before being released, so each
//! handle is released at most once.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tracing::{debug, info, warn};
use tunchain_core::{
    AttachParams, AttachmentId, LayerConfig, LayerError, LayerHandle, LayerKind, LayerMetrics,
    ResourceHandle,
};

/// Handle issued by a native engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub i64);

/// Handle-based API of a native engine
///
/// Every method may block.
pub trait NativeBackend: Send + Sync + 'static {
    /// Layer the engine implements
    fn kind(&self) -> LayerKind;

    /// Create and start an engine instance
    fn create(&self, config: &LayerConfig) -> Result<NativeHandle, LayerError>;

    /// Check if the instance is still alive
    fn is_alive(&self, handle: NativeHandle) -> bool;

    /// Read the instance's raw counters
    fn stats(&self, handle: NativeHandle) -> Result<LayerMetrics, LayerError>;

    /// Stop the instance and free its handle
    fn release(&self, handle: NativeHandle) -> Result<(), LayerError>;

    /// Apply new parameters to a running instance
    fn update_params(&self, _handle: NativeHandle, _config: &LayerConfig) -> Result<(), LayerError> {
        Err(LayerError::Unsupported)
    }

    /// Whether [`attach`](Self::attach) is implemented
    fn supports_attach(&self) -> bool {
        false
    }

    /// Bind a late-bound OS resource to the instance
    fn attach(
        &self,
        _handle: NativeHandle,
        _resource: ResourceHandle,
        _params: &AttachParams,
    ) -> Result<NativeHandle, LayerError> {
        Err(LayerError::Unsupported)
    }

    /// Free an attachment handle
    fn detach(&self, _attachment: NativeHandle) -> Result<(), LayerError> {
        Ok(())
    }
}

fn aborted(e: JoinError) -> LayerError {
    LayerError::Io(format!("native call aborted: {}", e))
}

/// Run a backend call on the blocking pool
async fn blocking<B, T, F>(backend: &Arc<B>, f: F) -> Result<T, LayerError>
where
    B: NativeBackend,
    T: Send + 'static,
    F: FnOnce(&B) -> Result<T, LayerError> + Send + 'static,
{
    let backend = backend.clone();
    tokio::task::spawn_blocking(move || f(&backend))
        .await
        .map_err(aborted)?
}

#[derive(Debug, Default)]
struct Slots {
    engine: Option<NativeHandle>,
    attachment: Option<NativeHandle>,
}

/// Layer backed by a [`NativeBackend`]
pub struct NativeLayer<B> {
    backend: Arc<B>,
    slots: Arc<Mutex<Slots>>,
}

impl<B: NativeBackend> NativeLayer<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    /// Engine handle of the running instance
    pub async fn engine_handle(&self) -> Option<NativeHandle> {
        self.slots.lock().await.engine
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Push new parameters to the running engine
    pub async fn update_params(&self, config: &LayerConfig) -> Result<(), LayerError> {
        let kind = self.backend.kind();
        if config.kind() != kind {
            return Err(LayerError::Config(format!(
                "{} engine given a {} block",
                kind,
                config.kind()
            )));
        }

        let config = config.clone();
        self.with_engine(move |b, engine| b.update_params(engine, &config))
            .await?;
        info!("{} parameters updated", kind);
        Ok(())
    }

    /// Run `f` against the engine handle on the blocking pool, holding the slot lock throughout
    async fn with_engine<T, F>(&self, f: F) -> Result<T, LayerError>
    where
        T: Send + 'static,
        F: FnOnce(&B, NativeHandle) -> Result<T, LayerError> + Send + 'static,
    {
        let slots = self.slots.clone().lock_owned().await;
        let Some(engine) = slots.engine else {
            return Err(LayerError::NotRunning);
        };

        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || {
            let result = f(&backend, engine);
            drop(slots);
            result
        })
        .await
        .map_err(aborted)?
    }
}

#[async_trait]
impl<B: NativeBackend> LayerHandle for NativeLayer<B> {
    fn kind(&self) -> LayerKind {
        self.backend.kind()
    }

    async fn start(&self, config: &LayerConfig) -> Result<(), LayerError> {
        let kind = self.kind();
        let mut slots = self.slots.clone().lock_owned().await;
        if slots.engine.is_some() {
            return Err(LayerError::Start(format!("{} engine already running", kind)));
        }

        let backend = self.backend.clone();
        let config = config.clone();
        let handle = tokio::task::spawn_blocking(move || -> Result<NativeHandle, LayerError> {
            let handle = backend.create(&config)?;
            if handle.0 < 0 {
                return Err(LayerError::Start(format!(
                    "{} engine returned invalid handle {}",
                    kind, handle.0
                )));
            }
            slots.engine = Some(handle);
            Ok(handle)
        })
        .await
        .map_err(aborted)??;

        info!("{} engine created (handle {})", kind, handle.0);
        Ok(())
    }

    async fn stop(&self) -> Result<(), LayerError> {
        let (attachment, engine) = {
            let mut slots = self.slots.lock().await;
            (slots.attachment.take(), slots.engine.take())
        };

        // Attachment first: it references the engine instance
        let mut first_err = None;
        if let Some(handle) = attachment {
            if let Err(e) = blocking(&self.backend, move |b| b.detach(handle)).await {
                warn!("{} detach failed: {}", self.kind(), e);
                first_err.get_or_insert(e);
            }
        }
        if let Some(handle) = engine {
            debug!("Releasing {} handle {}", self.kind(), handle.0);
            if let Err(e) = blocking(&self.backend, move |b| b.release(handle)).await {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn is_running(&self) -> bool {
        self.with_engine(|b, engine| Ok(b.is_alive(engine)))
            .await
            .unwrap_or(false)
    }

    async fn metrics(&self) -> Result<LayerMetrics, LayerError> {
        self.with_engine(|b, engine| b.stats(engine)).await
    }

    fn supports_attach(&self) -> bool {
        self.backend.supports_attach()
    }

    async fn attach(
        &self,
        resource: ResourceHandle,
        params: &AttachParams,
    ) -> Result<AttachmentId, LayerError> {
        let kind = self.kind();
        if !self.backend.supports_attach() {
            return Err(LayerError::Unsupported);
        }
        if !resource.is_valid() {
            return Err(LayerError::InvalidResource(format!("handle {}", resource.raw())));
        }
        if let Some(write) = params.write_handle {
            if !write.is_valid() {
                return Err(LayerError::InvalidResource(format!("write handle {}", write.raw())));
            }
        }

        let mut slots = self.slots.clone().lock_owned().await;
        let engine = slots
            .engine
            .ok_or_else(|| LayerError::Attach(format!("{} engine not running", kind)))?;
        if let Some(existing) = slots.attachment {
            return Ok(AttachmentId(existing.0 as u64));
        }

        let backend = self.backend.clone();
        let params = params.clone();
        let attachment = tokio::task::spawn_blocking(move || -> Result<NativeHandle, LayerError> {
            let attachment = backend.attach(engine, resource, &params)?;
            if attachment.0 < 0 {
                return Err(LayerError::Attach(format!(
                    "{} engine rejected resource {}",
                    kind,
                    resource.raw()
                )));
            }
            slots.attachment = Some(attachment);
            Ok(attachment)
        })
        .await
        .map_err(aborted)??;

        info!("{} attached to resource {}", kind, resource.raw());
        Ok(AttachmentId(attachment.0 as u64))
    }
}
