//! One client transaction against a running service.
//!
//! A [`ClientSession`] walks the client side of the protocol:
//!
//! ```text
//! Unregistered --register()--> AwaitAck --ack--> Ready
//! Ready --request_rotation()--> AwaitFin --fin--> Reading --> Done
//! any --deregister()/drop--> Deregistered
//! ```
//!
//! The session owns its two channels from the moment `register` creates them
//! until `deregister` (or drop) destroys them, including on error paths.

use super::protocol::{ChannelNames, ControlWord, Registration};
use super::wait::WaitPolicy;
use super::Payload;
use crate::cancel::CancellationToken;
use crate::config::{ResourceNames, SessionConfig};
use crate::error::{CaesarError, Result};
use crate::payload::{PayloadRecord, SharedPayload};
use crate::registry::{MessageQueue, NamedResourceRegistry, QueueCapacity, ResourceKind};
use tracing::{debug, info, warn};

/// Where a session is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    AwaitAck,
    /// Acknowledged; the payload may be written.
    Ready,
    AwaitFin,
    Reading,
    /// The result has been read.
    Done,
    Deregistered,
}

/// Client side of one transaction.
pub struct ClientSession<'r, G: NamedResourceRegistry> {
    registry: &'r G,
    names: ResourceNames,
    registration: Registration,
    channels: ChannelNames,
    config: SessionConfig,
    cancel: CancellationToken,
    state: SessionState,
    to_service: Option<G::Queue>,
    from_service: Option<G::Queue>,
    payload: Option<Payload<G>>,
    /// Channels this session created and must destroy.
    owned_channels: bool,
}

impl<'r, G: NamedResourceRegistry> ClientSession<'r, G> {
    pub fn new(
        registry: &'r G,
        names: ResourceNames,
        registration: Registration,
        config: SessionConfig,
    ) -> Self {
        let channels = registration.channels();
        Self {
            registry,
            names,
            registration,
            channels,
            config,
            cancel: CancellationToken::new(),
            state: SessionState::Unregistered,
            to_service: None,
            from_service: None,
            payload: None,
            owned_channels: false,
        }
    }

    /// Use `cancel` to interrupt the session's reply waits.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    fn reply_policy(&self) -> WaitPolicy {
        WaitPolicy::new(self.config.reply_timeout, self.cancel.clone())
    }

    fn lock_policy(&self) -> WaitPolicy {
        WaitPolicy::new(Some(self.config.lock_timeout), self.cancel.clone())
    }

    fn expect_state(&self, expected: SessionState, operation: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CaesarError::Other(format!(
                "{} called in state {:?}, expected {:?}",
                operation, self.state, expected
            )))
        }
    }

    /// Create the channels, register with the service and wait for `ack`.
    ///
    /// The service's objects are opened first, so a missing service fails
    /// before anything is created.
    pub fn register(&mut self) -> Result<()> {
        self.expect_state(SessionState::Unregistered, "register")?;

        let registration_queue = self.registry.open_queue(&self.names.registration)?;
        self.payload = Some(SharedPayload::open(self.registry, &self.names)?);

        if self.config.reclaim_stale {
            for name in [&self.channels.receive, &self.channels.send] {
                if self.registry.destroy_if_exists(name, ResourceKind::Queue)? {
                    warn!("Reclaimed stale channel {}", name);
                }
            }
        }

        let from_service = self
            .registry
            .create_queue(&self.channels.receive, QueueCapacity::default())?;
        self.from_service = Some(from_service);
        self.owned_channels = true;
        self.to_service = Some(
            self.registry
                .create_queue(&self.channels.send, QueueCapacity::default())?,
        );

        let priority = self.registration.priority;
        self.reply_policy().wait_for("send the registration", |slice| {
            Ok(registration_queue
                .send(self.registration.encode(), priority, slice)?
                .then_some(()))
        })?;
        debug!(
            client = %self.registration.base_name,
            priority,
            "Sent registration"
        );

        self.state = SessionState::AwaitAck;
        self.await_word(ControlWord::Ack, "receive ack")?;
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Write the request, trigger the service and read back the result.
    pub fn request_rotation(&mut self, request: &PayloadRecord) -> Result<PayloadRecord> {
        self.expect_state(SessionState::Ready, "request_rotation")?;
        let payload = self.payload()?;

        let mut guard = payload.lock(&self.lock_policy())?;
        guard.write(request)?;
        guard.unlock()?;

        let to_service = self.to_service.as_ref().ok_or_else(not_registered)?;
        let priority = self.registration.priority;
        self.reply_policy().wait_for("send caesar", |slice| {
            Ok(to_service
                .send(ControlWord::Caesar.as_bytes(), priority, slice)?
                .then_some(()))
        })?;

        self.state = SessionState::AwaitFin;
        self.await_word(ControlWord::Fin, "receive fin")?;

        self.state = SessionState::Reading;
        let guard = self.payload()?.lock(&self.lock_policy())?;
        let result = guard.read();
        guard.unlock()?;
        self.state = SessionState::Done;

        info!(
            client = %self.registration.base_name,
            shift = result.shift,
            "Received rotated message"
        );
        Ok(result)
    }

    /// Destroy both channels, receive channel first.
    pub fn deregister(mut self) -> Result<()> {
        self.teardown()
    }

    fn payload(&self) -> Result<&Payload<G>> {
        self.payload.as_ref().ok_or_else(not_registered)
    }

    fn await_word(&self, word: ControlWord, stage: &'static str) -> Result<()> {
        let queue = self.from_service.as_ref().ok_or_else(not_registered)?;
        let message = self
            .reply_policy()
            .wait_for(stage, |slice| queue.receive(slice))?;
        word.expect_in(&message)
    }

    fn teardown(&mut self) -> Result<()> {
        self.state = SessionState::Deregistered;
        self.to_service = None;
        self.from_service = None;
        self.payload = None;
        if !self.owned_channels {
            return Ok(());
        }
        self.owned_channels = false;

        let mut first_error = None;
        for name in [&self.channels.receive, &self.channels.send] {
            if let Err(e) = self.registry.destroy_if_exists(name, ResourceKind::Queue) {
                warn!("Failed to destroy channel {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<G: NamedResourceRegistry> Drop for ClientSession<'_, G> {
    fn drop(&mut self) {
        if self.owned_channels {
            let _ = self.teardown();
        }
    }
}

fn not_registered() -> CaesarError {
    CaesarError::Other("session is not registered".to_string())
}

/// Run one complete transaction: register, rotate, deregister.
pub fn rotate_via_service<G: NamedResourceRegistry>(
    registry: &G,
    names: &ResourceNames,
    registration: &Registration,
    request: &PayloadRecord,
    config: SessionConfig,
) -> Result<PayloadRecord> {
    let mut session = ClientSession::new(registry, names.clone(), registration.clone(), config);
    session.register()?;
    let result = session.request_rotation(request)?;
    session.deregister()?;
    Ok(result)
}
