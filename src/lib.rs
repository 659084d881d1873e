//! Core of an AI-assisted photo editor: submit an image plus a natural
//! language instruction to an editing service, poll until the edit resolves,
//! and keep a navigable chain of the variants produced along the way. A
//! local simulator stands in for the remote service during offline
//! development.

pub mod models;
pub mod service;
pub mod session;
pub mod simulator;

pub use models::{EditHandle, EditRequest, EditStatus, ImagePayload, Variant};
pub use service::{EditError, EditService, RemoteEditService};
pub use session::{Banner, Direction, EditSession, SessionConfig, SessionSnapshot};
pub use simulator::{EditSimulator, SimulatorConfig};
