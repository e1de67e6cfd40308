//! Output device and context lifecycle

use crate::backend::{Backend, ContextHandle, DeviceAttribute, DeviceHandle};
use crate::config::StreamerDesc;
use crate::error::{Result, VoxStreamError};
use std::sync::Arc;

/// Owns the backend device/context pair and the voice capacity it reports.
///
/// Must be initialized before any stream is created and de-initialized only
/// after every stream is gone. Dropping the manager de-initializes it.
pub struct DeviceManager<B: Backend> {
    backend: Arc<B>,
    desc: StreamerDesc,
    device: Option<DeviceHandle>,
    context: Option<ContextHandle>,
    max_voices: usize,
}

impl<B: Backend> DeviceManager<B> {
    pub fn new(backend: Arc<B>, desc: StreamerDesc) -> Self {
        let max_voices = desc.default_max_voices;
        Self {
            backend,
            desc,
            device: None,
            context: None,
            max_voices,
        }
    }

    /// Open the default device, create and activate a context, and discover
    /// voice capacity. Nothing stays acquired if any step fails.
    pub fn init(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Err(VoxStreamError::AlreadyInitialized("device manager"));
        }

        let result = self.acquire();
        if let Err(e) = &result {
            log::error!("Audio device init failed: {}", e);
            self.deinit();
        }
        result
    }

    fn acquire(&mut self) -> Result<()> {
        let device = self
            .backend
            .open_device()
            .map_err(|e| VoxStreamError::BackendUnavailable(e.to_string()))?;
        self.device = Some(device);

        let context = self
            .backend
            .create_context(device)
            .map_err(|e| VoxStreamError::BackendUnavailable(e.to_string()))?;
        self.context = Some(context);

        self.backend
            .make_context_current(Some(context))
            .map_err(|e| VoxStreamError::BackendUnavailable(e.to_string()))?;

        let attributes = self
            .backend
            .device_attributes(device)
            .map_err(|e| VoxStreamError::BackendUnavailable(e.to_string()))?;

        self.max_voices = self.desc.default_max_voices;
        for attribute in attributes {
            match attribute {
                DeviceAttribute::MonoVoices(count) => {
                    log::info!("Device reports {} mono voices", count);
                    self.max_voices = count as usize;
                }
                DeviceAttribute::StereoVoices(count) => {
                    log::info!("Device reports {} stereo voices", count);
                }
                DeviceAttribute::Frequency(rate) => {
                    log::debug!("Device mixing frequency {} Hz", rate);
                }
                DeviceAttribute::Other(..) => {}
            }
        }

        log::info!("Audio device ready, {} voices available", self.max_voices);
        Ok(())
    }

    /// Destroy the context, then close the device. Safe to call at any time.
    pub fn deinit(&mut self) {
        if let Some(context) = self.context.take() {
            if let Err(e) = self.backend.make_context_current(None) {
                log::warn!("Failed to release current context: {}", e);
            }
            self.backend.destroy_context(context);
        }

        if let Some(device) = self.device.take() {
            self.backend.close_device(device);
            log::debug!("Audio device closed");
        }

        self.max_voices = self.desc.default_max_voices;
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some() && self.context.is_some()
    }

    pub fn max_voices(&self) -> usize {
        self.max_voices
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn desc(&self) -> &StreamerDesc {
        &self.desc
    }
}

impl<B: Backend> Drop for DeviceManager<B> {
    fn drop(&mut self) {
        self.deinit();
    }
}
