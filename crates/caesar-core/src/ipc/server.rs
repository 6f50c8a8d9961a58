//! The long-lived Caesar service.
//!
//! One service owns the payload region, the registration queue and the
//! payload mutex. It serves registered clients strictly one at a time:
//!
//! 1. LISTENING: take the highest-priority registration (unbounded, cancellable)
//! 2. ACK: open the client's channels and send `ack`
//! 3. AWAIT_INSTRUCTION: wait for `caesar` on the client's send channel
//! 4. PROCESS: rotate the payload inside the critical section
//! 5. RESPOND: send `fin`
//! 6. RELEASE: wait for the client to tear down its receive channel
//!
//! Steps 2-6 are bounded by [`ServiceConfig::client_timeout`] and are not
//! interrupted by cancellation, so a started transaction always finishes or
//! times out. A failure blamed on one client is logged and the service goes
//! back to LISTENING; a failure of the service's own objects is returned.

use super::protocol::{ControlWord, Registration};
use super::wait::WaitPolicy;
use super::Payload;
use crate::cancel::CancellationToken;
use crate::config::{IpcConfig, ResourceNames, ServiceConfig};
use crate::error::{CaesarError, Result};
use crate::payload::SharedPayload;
use crate::registry::{MessageQueue, NamedResourceRegistry, QueueCapacity, ResourceKind};
use tracing::{debug, error, info, warn};

/// How a single transaction ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// `fin` was sent and the payload holds the rotated message.
    Completed { client: String },
    /// The registration or the instruction was not acceptable.
    Rejected { client: Option<String>, reason: String },
    /// The client's channels failed or the client stopped responding.
    Abandoned { client: String, reason: String },
}

/// Counters kept across the service's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub completed: u64,
    pub rejected: u64,
    pub abandoned: u64,
}

impl ServiceStats {
    pub fn total(&self) -> u64 {
        self.completed + self.rejected + self.abandoned
    }

    fn record(&mut self, outcome: &TransactionOutcome) {
        match outcome {
            TransactionOutcome::Completed { .. } => self.completed += 1,
            TransactionOutcome::Rejected { .. } => self.rejected += 1,
            TransactionOutcome::Abandoned { .. } => self.abandoned += 1,
        }
    }
}

/// A running service and the named objects it owns.
///
/// Dropping the service destroys its objects; [`CaesarService::shutdown`]
/// does the same and reports failures.
pub struct CaesarService<G: NamedResourceRegistry> {
    registry: G,
    names: ResourceNames,
    config: ServiceConfig,
    registration: G::Queue,
    payload: Payload<G>,
    stats: ServiceStats,
    torn_down: bool,
}

impl<G: NamedResourceRegistry> CaesarService<G> {
    /// Create the mutex, the payload region and the registration queue.
    ///
    /// Creation is exclusive: a leftover object from a crashed service makes
    /// this fail unless `config.reclaim_stale` is set. On failure, whatever
    /// was created is destroyed again.
    pub fn start(registry: G, names: ResourceNames, config: ServiceConfig) -> Result<Self> {
        if config.reclaim_stale {
            reclaim(&registry, &names)?;
        }

        let setup = WaitPolicy::bounded(config.client_timeout);
        let payload = SharedPayload::initialize(&registry, &names, &setup)?;

        let registration =
            match registry.create_queue(&names.registration, QueueCapacity::default()) {
                Ok(queue) => queue,
                Err(e) => {
                    drop(payload);
                    for (name, kind) in [
                        (&names.payload, ResourceKind::SharedRegion),
                        (&names.mutex, ResourceKind::Mutex),
                    ] {
                        if let Err(cleanup) = registry.destroy(name, kind) {
                            error!("Failed to roll back {}: {}", name, cleanup);
                        }
                    }
                    return Err(e);
                }
            };

        info!(
            "Service ready: payload={} registration={} mutex={}",
            names.payload, names.registration, names.mutex
        );
        Ok(Self {
            registry,
            names,
            config,
            registration,
            payload,
            stats: ServiceStats::default(),
            torn_down: false,
        })
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats
    }

    /// Serve transactions until `cancel` fires or a fatal error occurs.
    ///
    /// Cancellation is only observed while LISTENING. Returns the stats on
    /// cancellation; the service stays up and `run` may be called again.
    pub fn run(&mut self, cancel: &CancellationToken) -> Result<ServiceStats> {
        loop {
            match self.serve_next(cancel) {
                Ok(_) => {}
                Err(CaesarError::Cancelled) => {
                    debug!("Service loop cancelled while listening");
                    return Ok(self.stats);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for one registration and run its transaction to the end.
    ///
    /// Only fatal errors and cancellation are returned as `Err`.
    pub fn serve_next(&mut self, cancel: &CancellationToken) -> Result<TransactionOutcome> {
        let listening = WaitPolicy::until_cancelled(cancel.clone());
        let message = listening.wait_for("receive a registration", |slice| {
            self.registration.receive(slice)
        })?;

        let outcome = match Registration::decode(&message) {
            Ok(registration) => {
                info!(
                    client = %registration.base_name,
                    priority = registration.priority,
                    "Accepted registration"
                );
                match self.serve_client(&registration) {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => TransactionOutcome::Abandoned {
                        client: registration.base_name.clone(),
                        reason: e.to_string(),
                    },
                }
            }
            Err(e) => TransactionOutcome::Rejected {
                client: None,
                reason: e.to_string(),
            },
        };

        match &outcome {
            TransactionOutcome::Completed { client } => {
                info!(client = %client, "Transaction completed");
            }
            TransactionOutcome::Rejected { client, reason } => {
                warn!(client = ?client, "Transaction rejected: {}", reason);
            }
            TransactionOutcome::Abandoned { client, reason } => {
                warn!(client = %client, "Transaction abandoned: {}", reason);
            }
        }
        self.stats.record(&outcome);
        Ok(outcome)
    }

    fn serve_client(&self, registration: &Registration) -> Result<TransactionOutcome> {
        let client = registration.base_name.as_str();
        let channels = registration.channels();
        let bounded = WaitPolicy::bounded(self.config.client_timeout);

        // The client creates both channels before registering.
        let to_client = self
            .registry
            .open_queue(&channels.receive)
            .map_err(|e| e.for_client(client))?;
        let from_client = self
            .registry
            .open_queue(&channels.send)
            .map_err(|e| e.for_client(client))?;

        // ACK
        send_word(&to_client, ControlWord::Ack, registration.priority, &bounded)
            .map_err(|e| e.for_client(client))?;
        debug!(client = %client, stage = "ack", "Sent ack");

        // AWAIT_INSTRUCTION
        let instruction = bounded
            .wait_for("receive an instruction", |slice| from_client.receive(slice))
            .map_err(|e| e.for_client(client))?;
        if let Err(e) = ControlWord::Caesar.expect_in(&instruction) {
            return Ok(TransactionOutcome::Rejected {
                client: Some(client.to_string()),
                reason: e.to_string(),
            });
        }

        // PROCESS
        let mut guard = self.payload.lock(&bounded)?;
        let rotated = guard.rotate_in_place();
        guard.unlock()?;
        debug!(
            client = %client,
            shift = rotated.shift,
            bytes = rotated.message_len(),
            stage = "process",
            "Rotated payload"
        );

        // RESPOND
        send_word(&to_client, ControlWord::Fin, registration.priority, &bounded)
            .map_err(|e| e.for_client(client))?;
        drop(to_client);
        drop(from_client);

        // RELEASE
        self.await_release(client, &channels.receive);

        Ok(TransactionOutcome::Completed {
            client: client.to_string(),
        })
    }

    /// Wait until the client has read its result and destroyed its receive
    /// channel, so the next client cannot overwrite the payload first.
    fn await_release(&self, client: &str, receive_channel: &str) {
        let bounded = WaitPolicy::bounded(self.config.client_timeout);
        let released = bounded.wait_for("observe client teardown", |slice| {
            if !self.registry.exists(receive_channel, ResourceKind::Queue)? {
                return Ok(Some(()));
            }
            std::thread::sleep(slice.min(IpcConfig::RELEASE_POLL_INTERVAL));
            Ok(None)
        });
        if let Err(e) = released {
            warn!(client = %client, stage = "release", "Client did not tear down: {}", e);
        }
    }

    /// Destroy the service's objects and report the first failure.
    pub fn shutdown(mut self) -> Result<()> {
        let result = self.teardown();
        info!(
            "Service stopped: completed={} rejected={} abandoned={}",
            self.stats.completed, self.stats.rejected, self.stats.abandoned
        );
        result
    }

    fn teardown(&mut self) -> Result<()> {
        self.torn_down = true;
        let mut first_error = None;
        for (name, kind) in [
            (&self.names.registration, ResourceKind::Queue),
            (&self.names.payload, ResourceKind::SharedRegion),
            (&self.names.mutex, ResourceKind::Mutex),
        ] {
            match self.registry.destroy(name, kind) {
                Ok(()) => debug!("Destroyed {} {}", kind, name),
                Err(e) => {
                    error!("Teardown failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<G: NamedResourceRegistry> Drop for CaesarService<G> {
    fn drop(&mut self) {
        if !self.torn_down {
            // Errors are already logged by teardown.
            let _ = self.teardown();
        }
    }
}

fn send_word<Q: MessageQueue>(
    queue: &Q,
    word: ControlWord,
    priority: u32,
    policy: &WaitPolicy,
) -> Result<()> {
    let stage = match word {
        ControlWord::Ack => "send ack",
        ControlWord::Caesar => "send caesar",
        ControlWord::Fin => "send fin",
    };
    policy.wait_for(stage, |slice| {
        Ok(queue.send(word.as_bytes(), priority, slice)?.then_some(()))
    })
}

/// Unlink objects left behind by a service that did not shut down cleanly.
fn reclaim<G: NamedResourceRegistry>(registry: &G, names: &ResourceNames) -> Result<()> {
    for (name, kind) in [
        (&names.registration, ResourceKind::Queue),
        (&names.payload, ResourceKind::SharedRegion),
        (&names.mutex, ResourceKind::Mutex),
    ] {
        if registry.destroy_if_exists(name, kind)? {
            warn!("Reclaimed stale {} {}", kind, name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::ipc::client::rotate_via_service;
    use crate::payload::{PayloadRecord, RawPayload};
    use crate::registry::memory::MemoryQueue;
    use crate::registry::{InMemoryRegistry, SharedRegion};
    use std::thread;
    use std::time::{Duration, Instant};

    const SHORT: Duration = Duration::from_millis(200);

    fn config() -> ServiceConfig {
        ServiceConfig::new().with_client_timeout(Duration::from_secs(2))
    }

    fn start(registry: &InMemoryRegistry, ns: &str) -> CaesarService<InMemoryRegistry> {
        CaesarService::start(registry.clone(), ResourceNames::namespaced(ns), config()).unwrap()
    }

    const QUICK: Duration = Duration::from_millis(300);

    /// A service that gives up on an unresponsive client after `QUICK`.
    fn start_impatient(registry: &InMemoryRegistry, ns: &str) -> CaesarService<InMemoryRegistry> {
        CaesarService::start(
            registry.clone(),
            ResourceNames::namespaced(ns),
            ServiceConfig::new().with_client_timeout(QUICK),
        )
        .unwrap()
    }

    /// Channels for a hand-driven client, created the way a real client does.
    fn open_channels(registry: &InMemoryRegistry, base: &str) -> (MemoryQueue, MemoryQueue) {
        let to_client = registry
            .create_queue(&format!("/mq_received_by_{}", base), QueueCapacity::default())
            .unwrap();
        let from_client = registry
            .create_queue(&format!("/mq_sent_from_{}", base), QueueCapacity::default())
            .unwrap();
        (to_client, from_client)
    }

    fn spawn_client(
        registry: &InMemoryRegistry,
        names: &ResourceNames,
        base: &'static str,
    ) -> thread::JoinHandle<Result<PayloadRecord>> {
        let registry = registry.clone();
        let names = names.clone();
        thread::spawn(move || {
            rotate_via_service(
                &registry,
                &names,
                &Registration::new(base, 0).unwrap(),
                &PayloadRecord::new("Hello", 3).unwrap(),
                SessionConfig::default(),
            )
        })
    }

    #[test]
    fn test_happy_path() {
        let registry = InMemoryRegistry::new();
        let mut service = start(&registry, "happy");
        let names = service.names().clone();

        let client_registry = registry.clone();
        let client = thread::spawn(move || {
            rotate_via_service(
                &client_registry,
                &names,
                &Registration::new("alice", 3).unwrap(),
                &PayloadRecord::new("Hello", 3).unwrap(),
                SessionConfig::default(),
            )
        });

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        assert_eq!(
            outcome,
            TransactionOutcome::Completed {
                client: "alice".to_string()
            }
        );
        let result = client.join().unwrap().unwrap();
        assert_eq!(result.message, "Khoor");
        assert_eq!(result.shift, 3);
        assert_eq!(service.stats().completed, 1);
    }

    #[test]
    fn test_concurrent_clients_are_serialized() {
        let registry = InMemoryRegistry::new();
        let mut service = start(&registry, "concurrent");
        let names = service.names().clone();
        let cancel = CancellationToken::new();

        let requests = [("alice", 3, "Hello", "Khoor"), ("bob", 1, "abc", "bcd")];
        let clients: Vec<_> = requests
            .iter()
            .map(|&(base, shift, message, expected)| {
                let registry = registry.clone();
                let names = names.clone();
                thread::spawn(move || {
                    let result = rotate_via_service(
                        &registry,
                        &names,
                        &Registration::new(base, 0).unwrap(),
                        &PayloadRecord::new(message, shift).unwrap(),
                        SessionConfig::default(),
                    )
                    .unwrap();
                    assert_eq!(result.message, expected);
                })
            })
            .collect();

        for _ in 0..requests.len() {
            let outcome = service.serve_next(&cancel).unwrap();
            assert!(matches!(outcome, TransactionOutcome::Completed { .. }));
        }
        for client in clients {
            client.join().unwrap();
        }
    }

    #[test]
    fn test_process_rotates_raw_bytes() {
        let registry = InMemoryRegistry::new();
        let mut service = start_impatient(&registry, "raw");
        let names = service.names().clone();
        let region = registry.open_region(&names.payload).unwrap();
        let registration = registry.open_queue(&names.registration).unwrap();
        let (to_client, from_client) = open_channels(&registry, "cpeer");

        // Latin-1 text from a C peer is not valid UTF-8.
        let mut raw = RawPayload::empty();
        raw.message[..4].copy_from_slice(b"caf\xe9");
        raw.shift = 1;
        region.store(&raw);
        registration.send(b"cpeer", 0, SHORT).unwrap();
        from_client.send(b"caesar", 0, SHORT).unwrap();

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        assert!(matches!(outcome, TransactionOutcome::Completed { .. }));
        assert_eq!(region.load().message_bytes(), b"dbg\xe9");
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "ack");
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "fin");

        // High bytes must not grow past the region's capacity.
        let mut raw = RawPayload::empty();
        raw.message[..200].fill(0xe9);
        raw.shift = 5;
        region.store(&raw);
        registration.send(b"cpeer", 0, SHORT).unwrap();
        from_client.send(b"caesar", 0, SHORT).unwrap();

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        assert!(matches!(outcome, TransactionOutcome::Completed { .. }));
        assert_eq!(region.load().message_bytes(), &[0xe9; 200][..]);
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "ack");
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "fin");
        assert_eq!(service.stats().completed, 2);
    }

    #[test]
    fn test_silent_client_is_abandoned_and_next_client_served() {
        let registry = InMemoryRegistry::new();
        let mut service = start_impatient(&registry, "silent");
        let names = service.names().clone();
        let (to_client, _from_client) = open_channels(&registry, "mute");
        registry
            .open_queue(&names.registration)
            .unwrap()
            .send(b"mute", 0, SHORT)
            .unwrap();
        let alice = spawn_client(&registry, &names, "alice");

        let started = Instant::now();
        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        match outcome {
            TransactionOutcome::Abandoned { client, reason } => {
                assert_eq!(client, "mute");
                assert!(reason.contains("instruction"), "reason: {}", reason);
            }
            other => panic!("Expected Abandoned, got: {:?}", other),
        }
        assert!(started.elapsed() >= QUICK);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "ack");
        assert!(to_client.receive(SHORT).unwrap().is_none());

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        assert_eq!(
            outcome,
            TransactionOutcome::Completed {
                client: "alice".to_string()
            }
        );
        assert_eq!(alice.join().unwrap().unwrap().message, "Khoor");
        assert_eq!(service.stats().abandoned, 1);
        assert_eq!(service.stats().completed, 1);
    }

    #[test]
    fn test_client_that_never_tears_down_does_not_block_service() {
        let registry = InMemoryRegistry::new();
        let mut service = start_impatient(&registry, "linger");
        let names = service.names().clone();
        let (to_client, from_client) = open_channels(&registry, "linger");
        registry
            .open_queue(&names.registration)
            .unwrap()
            .send(b"linger", 0, SHORT)
            .unwrap();
        from_client.send(b"caesar", 0, SHORT).unwrap();
        let alice = spawn_client(&registry, &names, "alice");

        let started = Instant::now();
        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        assert_eq!(
            outcome,
            TransactionOutcome::Completed {
                client: "linger".to_string()
            }
        );
        assert!(started.elapsed() >= QUICK);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "ack");
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "fin");
        assert!(registry
            .exists("/mq_received_by_linger", ResourceKind::Queue)
            .unwrap());

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        assert!(matches!(outcome, TransactionOutcome::Completed { .. }));
        assert_eq!(alice.join().unwrap().unwrap().message, "Khoor");
    }

    #[test]
    fn test_unknown_instruction_is_rejected_without_fin() {
        let registry = InMemoryRegistry::new();
        let mut service = start(&registry, "reject");
        let names = service.names().clone();

        let to_client = registry
            .create_queue("/mq_received_by_mallory", QueueCapacity::default())
            .unwrap();
        let from_client = registry
            .create_queue("/mq_sent_from_mallory", QueueCapacity::default())
            .unwrap();
        let registration = registry.open_queue(&names.registration).unwrap();
        registration.send(b"mallory", 0, SHORT).unwrap();
        from_client.send(b"rot13", 0, SHORT).unwrap();

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        match outcome {
            TransactionOutcome::Rejected { client, reason } => {
                assert_eq!(client.as_deref(), Some("mallory"));
                assert!(reason.contains("rot13"));
            }
            other => panic!("Expected Rejected, got: {:?}", other),
        }
        assert_eq!(to_client.receive(SHORT).unwrap().unwrap().text(), "ack");
        assert!(to_client.receive(SHORT).unwrap().is_none());
        assert_eq!(service.stats().rejected, 1);
    }

    #[test]
    fn test_missing_client_channels_are_not_fatal() {
        let registry = InMemoryRegistry::new();
        let mut service = start(&registry, "abandon");
        let registration = registry.open_queue(&service.names().registration).unwrap();
        registration.send(b"ghost", 5, SHORT).unwrap();

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        match outcome {
            TransactionOutcome::Abandoned { client, reason } => {
                assert_eq!(client, "ghost");
                assert!(reason.contains("mq_open"));
            }
            other => panic!("Expected Abandoned, got: {:?}", other),
        }
        assert_eq!(service.stats().abandoned, 1);
    }

    #[test]
    fn test_invalid_registration_is_rejected() {
        let registry = InMemoryRegistry::new();
        let mut service = start(&registry, "badname");
        let registration = registry.open_queue(&service.names().registration).unwrap();
        registration.send(b"has space", 0, SHORT).unwrap();

        let outcome = service.serve_next(&CancellationToken::new()).unwrap();
        assert!(matches!(
            outcome,
            TransactionOutcome::Rejected { client: None, .. }
        ));
    }

    #[test]
    fn test_run_returns_stats_on_cancel() {
        let registry = InMemoryRegistry::new();
        let mut service = start(&registry, "cancel");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });

        let stats = service.run(&cancel).unwrap();
        assert_eq!(stats.total(), 0);
        canceller.join().unwrap();
    }

    #[test]
    fn test_shutdown_destroys_everything() {
        let registry = InMemoryRegistry::new();
        let service = start(&registry, "teardown");
        let names = service.names().clone();
        service.shutdown().unwrap();

        assert!(registry.names().is_empty());
        let err = registry.open_queue(&names.registration).unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.open_region(&names.payload).unwrap_err().is_not_found());
        assert!(registry.open_mutex(&names.mutex).unwrap_err().is_not_found());
    }

    #[test]
    fn test_drop_destroys_everything() {
        let registry = InMemoryRegistry::new();
        drop(start(&registry, "drop"));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_start_failure_names_operation_and_rolls_back() {
        let registry = InMemoryRegistry::new();
        registry.fail_next("mq_open");

        let err = CaesarService::start(
            registry.clone(),
            ResourceNames::namespaced("fail"),
            config(),
        )
        .err()
        .expect("start should fail");
        assert!(err.is_fatal());
        assert_eq!(err.operation(), Some("mq_open"));
        assert!(err.to_string().contains("mq_open"));
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_stale_objects_block_start_unless_reclaimed() {
        let registry = InMemoryRegistry::new();
        let names = ResourceNames::namespaced("stale");
        registry
            .create_queue(&names.registration, QueueCapacity::default())
            .unwrap();

        let err = CaesarService::start(registry.clone(), names.clone(), config())
            .err()
            .expect("stale queue should block start");
        assert!(err.is_already_exists());
        assert_eq!(registry.names(), vec![names.registration.clone()]);

        let service =
            CaesarService::start(registry.clone(), names, config().with_reclaim_stale(true))
                .unwrap();
        service.shutdown().unwrap();
        assert!(registry.names().is_empty());
    }
}
