//! Rendezvous protocol between the Caesar service and its clients.
//!
//! - [`protocol`]: control words, channel naming, registrations
//! - [`wait`]: bounded, cancellable waits used at every blocking step
//! - [`server`]: the long-lived service loop
//! - [`client`]: one client transaction

pub mod client;
pub mod protocol;
pub mod server;
pub mod wait;

pub use client::{rotate_via_service, ClientSession, SessionState};
pub use protocol::{ChannelNames, ControlWord, Registration};
pub use server::{CaesarService, ServiceStats, TransactionOutcome};
pub use wait::WaitPolicy;

use crate::payload::SharedPayload;
use crate::registry::NamedResourceRegistry;

/// The payload handle type for a given registry.
pub(crate) type Payload<G> = SharedPayload<
    <G as NamedResourceRegistry>::Region,
    <G as NamedResourceRegistry>::Mutex,
>;
