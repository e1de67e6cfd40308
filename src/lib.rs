//! # voxstream
//!
//! Streams decoded PCM into a small fixed pool of playback voices, a few
//! buffers at a time, so arbitrarily long sounds play without being held in
//! memory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use voxstream::backend::{CpalOutput, SoftwareBackend};
//! use voxstream::{StreamSession, StreamerDesc, VolumePan, VoxStreamError};
//!
//! let backend = Arc::new(SoftwareBackend::new(Default::default()));
//! let _output = CpalOutput::start(&backend)?;
//!
//! let mut session = StreamSession::with_backend(backend, StreamerDesc::default());
//! session.init()?;
//!
//! let id = session.play_file("music.ogg", VolumePan::new(-1000, 0))?;
//!
//! // once per host frame
//! while session.is_playing(id) {
//!     session.tick();
//!     std::thread::sleep(std::time::Duration::from_millis(16));
//! }
//! # Ok::<(), VoxStreamError>(())
//! ```
//!
//! ## Key Components
//!
//! - **[`StreamSession`]**: serial ids, play/stop/volume, and the per-frame [`tick`](StreamSession::tick)
//! - **[`StreamPump`]**: keeps one voice's buffer queue fed from one [`AudioSource`](source::AudioSource)
//! - **[`DeviceManager`]**: device/context lifecycle and voice capacity
//! - **[`Backend`](backend::Backend)**: the voice API the engine drives
//! - **[`SoftwareBackend`](backend::SoftwareBackend)**: in-process backend, audible through [`CpalOutput`](backend::CpalOutput)
//!
//! ## Threading
//!
//! Everything is cooperative and single-threaded. Streams only advance when the
//! host calls `tick()`; there are no timers or worker threads.

pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod math;
pub mod pump;
pub mod session;
pub mod source;

pub use config::{SoftwareBackendDesc, StreamerDesc};
pub use device::DeviceManager;
pub use error::VoxStreamError;
pub use events::StreamEvent;
pub use math::VolumePan;
pub use pump::{FillStatus, PumpState, StreamPump};
pub use session::{StreamId, StreamSession};
