//! Connection orchestration.
//!
//! Sequences the tunnel, the certificate authenticator and the control
//! channel into one connection, and folds their states into a single
//! [`ConnectionState`]:
//!
//! - [`OrchestratorHandle`]: `connect`, `disconnect`, state and events
//! - [`ConnectionState::derive`]: the pure combination of subsystem states
//! - [`ConnectionError::presentation`]: user-facing message per error
//!
//! A subsystem's terminal error ends the attempt: the control channel is
//! closed, pending credential work is cancelled, the tunnel is stopped and
//! the state stays `Disconnected(error)` until the next `connect`.

mod actor;
mod error;
mod state;

pub use actor::{DEFAULT_CONNECT_TIMEOUT, OrchestratorHandle, Subsystems};
pub use error::{ConnectionError, MessageCategory, OrchestratorError, Presentation};
pub use state::ConnectionState;
