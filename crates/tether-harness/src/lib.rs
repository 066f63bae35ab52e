//! Deterministic test doubles for the tether client.
//!
//! Implementations of the environment and collaborator traits whose
//! behavior is scripted by the test: a virtual clock with a seeded RNG, a
//! transport factory that records every open and send, an uploader driven
//! by explicit completion calls, and a transmitter and connectivity flag.
//!
//! Nothing here spawns tasks or sleeps on the real clock, so tests stay
//! reproducible given the same seed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim_env;
pub mod sim_send;
pub mod sim_transport;
pub mod sim_upload;

pub use sim_env::{SimEnv, SimInstant};
pub use sim_send::{SimConnectivity, SimTransmitter};
pub use sim_transport::{EventRecorder, SimTransportFactory};
pub use sim_upload::SimUploader;
