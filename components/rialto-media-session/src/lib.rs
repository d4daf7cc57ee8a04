//! The per-session façade and server-lifecycle engines: everything that
//! sits between the RPC surface and `rialto-media-pipeline`.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod client;
mod playback_service;
mod server_manager;
mod session;
mod web_audio_session;

pub use client::ClientNotifier;
pub use playback_service::{PlaybackService, PlaybackServiceConfig};
pub use server_manager::{ApplicationStateBroadcaster, ServerConfiguration, ServerState, SessionServerManager};
pub use session::{HaveDataStatus, MediaPipelineSession, PipelineState};
pub use web_audio_session::{BufferAvailable, DeviceInfo, WebAudioSession};
