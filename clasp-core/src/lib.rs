//! Clasp wearable-device protocol engine.
//! Host-driven: no I/O; the host feeds bytes, clock, and disconnects, and
//! acts on the returned events.

pub mod capability;
pub mod config;
pub mod correlator;
pub mod crypto;
pub mod frame;
pub mod session;
pub mod transfer;
pub mod weather;

pub use capability::{CapabilityRegistry, DeviceCapabilityProfile, Features, NotSupported};
pub use config::Config;
pub use correlator::{RequestError, RequestHandle, ResponseOutcome, RetryPolicy};
pub use crypto::{DeviceNonce, KeyScheme, PairingSecret, SessionKeyMaterial};
pub use frame::{Frame, FrameError, ProtocolVariant};
pub use session::{DeviceSession, SessionError, SessionEvent};
pub use transfer::{FileId, FileTransferState, TransferError, TransferId};
pub use weather::{map_weather, WeatherResponse, WeatherSnapshot};
