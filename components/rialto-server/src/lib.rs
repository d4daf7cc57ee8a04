//! The top-level facade: `Control` (client registration, application-state
//! and healthcheck fan-out) plus `RialtoServerImpl`, binding
//! `SessionServerManager`/`PlaybackService`/`Control` behind the §6 RPC
//! method surface as thin adapters.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod capabilities;
mod control;
mod server;

pub use control::Control;
pub use server::{
    get_buffer_available, get_buffer_delay, get_device_info, have_data, set_eos, write_buffer, RialtoServer,
    RialtoServerConfig, RialtoServerImpl,
};
