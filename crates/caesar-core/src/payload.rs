//! The shared payload mailbox and the mutex discipline around it.
//!
//! One region holds one `(message, shift)` pair. Clients write their request
//! into it and read their result back out; the service rotates it in place.
//! The only way to read or write the region is through a [`PayloadGuard`],
//! which holds the named mutex for as long as it lives.

use crate::cipher;
use crate::config::{IpcConfig, ResourceNames};
use crate::error::{CaesarError, Result};
use crate::ipc::wait::WaitPolicy;
use crate::registry::{NamedMutex, NamedResourceRegistry, ResourceKind, SharedRegion};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// In-memory layout of the shared region.
///
/// Matches `struct { char message[257]; int shift; }` so a C peer can map the
/// same object.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPayload {
    pub message: [u8; IpcConfig::MESSAGE_CAPACITY + 1],
    pub shift: i32,
}

impl RawPayload {
    pub const SIZE: usize = std::mem::size_of::<RawPayload>();

    /// All-zero payload: empty message, shift 0.
    pub fn empty() -> Self {
        Self {
            message: [0; IpcConfig::MESSAGE_CAPACITY + 1],
            shift: 0,
        }
    }

    pub fn encode(record: &PayloadRecord) -> Result<Self> {
        validate_message(&record.message)?;
        let mut raw = Self::empty();
        raw.message[..record.message.len()].copy_from_slice(record.message.as_bytes());
        raw.shift = record.shift;
        Ok(raw)
    }

    /// Length of the stored message: bytes before the first NUL, never
    /// counting the terminator slot.
    pub fn message_len(&self) -> usize {
        let bytes = &self.message[..IpcConfig::MESSAGE_CAPACITY];
        bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len())
    }

    /// The stored message as raw bytes.
    pub fn message_bytes(&self) -> &[u8] {
        &self.message[..self.message_len()]
    }

    /// Rotate the stored message in place by the stored shift.
    ///
    /// Works on the raw bytes, so content written by a peer that is not
    /// valid UTF-8 survives unchanged apart from its ASCII letters.
    pub fn rotate_message(&mut self) {
        let len = self.message_len();
        cipher::rotate_bytes(&mut self.message[..len], self.shift);
    }

    /// Decode up to the first NUL. Invalid UTF-8 is replaced, so this is for
    /// display at the client edge only.
    pub fn decode(&self) -> PayloadRecord {
        PayloadRecord {
            message: String::from_utf8_lossy(self.message_bytes()).into_owned(),
            shift: self.shift,
        }
    }
}

/// Decoded contents of the mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub message: String,
    pub shift: i32,
}

impl PayloadRecord {
    pub fn new(message: impl Into<String>, shift: i32) -> Result<Self> {
        let message = message.into();
        validate_message(&message)?;
        Ok(Self { message, shift })
    }
}

/// Check that a message fits the region and has no interior NUL.
pub fn validate_message(message: &str) -> Result<()> {
    if message.len() > IpcConfig::MESSAGE_CAPACITY {
        return Err(CaesarError::Validation {
            field: "message".to_string(),
            message: format!(
                "message is {} bytes, maximum is {}",
                message.len(),
                IpcConfig::MESSAGE_CAPACITY
            ),
        });
    }
    if message.contains('\0') {
        return Err(CaesarError::Validation {
            field: "message".to_string(),
            message: "message must not contain NUL".to_string(),
        });
    }
    Ok(())
}

/// The shared region paired with the mutex that guards it.
pub struct SharedPayload<R: SharedRegion, M: NamedMutex> {
    name: String,
    region: R,
    mutex: M,
}

impl<R: SharedRegion, M: NamedMutex> SharedPayload<R, M> {
    /// Create the mutex (AVAILABLE) and the region, then store `shift = 0`.
    ///
    /// If the region cannot be created the mutex is destroyed again, so a
    /// failed start leaves nothing behind.
    pub fn initialize<G>(registry: &G, names: &ResourceNames, policy: &WaitPolicy) -> Result<Self>
    where
        G: NamedResourceRegistry<Region = R, Mutex = M>,
    {
        let mutex = registry.create_mutex(&names.mutex)?;
        let region = match registry.create_region(&names.payload) {
            Ok(region) => region,
            Err(e) => {
                drop(mutex);
                if let Err(cleanup) = registry.destroy(&names.mutex, ResourceKind::Mutex) {
                    error!("Failed to roll back {}: {}", names.mutex, cleanup);
                }
                return Err(e);
            }
        };

        let payload = Self {
            name: names.payload.clone(),
            region,
            mutex,
        };
        if let Err(e) = payload.reset(policy) {
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

        debug!("Initialized shared payload {} ({} bytes)", names.payload, RawPayload::SIZE);
        Ok(payload)
    }

    fn reset(&self, policy: &WaitPolicy) -> Result<()> {
        let mut guard = self.lock(policy)?;
        guard.write(&PayloadRecord {
            message: String::new(),
            shift: 0,
        })?;
        guard.unlock()
    }

    /// Open an existing payload and mutex.
    pub fn open<G>(registry: &G, names: &ResourceNames) -> Result<Self>
    where
        G: NamedResourceRegistry<Region = R, Mutex = M>,
    {
        let mutex = registry.open_mutex(&names.mutex)?;
        let region = registry.open_region(&names.payload)?;
        Ok(Self {
            name: names.payload.clone(),
            region,
            mutex,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enter the critical section.
    pub fn lock(&self, policy: &WaitPolicy) -> Result<PayloadGuard<'_, R, M>> {
        policy.wait_for("acquire the payload mutex", |slice| {
            Ok(self.mutex.acquire(slice)?.then_some(()))
        })?;
        Ok(PayloadGuard {
            payload: self,
            released: false,
        })
    }
}

/// Proof that the payload mutex is held. Releases it on drop.
pub struct PayloadGuard<'a, R: SharedRegion, M: NamedMutex> {
    payload: &'a SharedPayload<R, M>,
    released: bool,
}

impl<R: SharedRegion, M: NamedMutex> PayloadGuard<'_, R, M> {
    pub fn read(&self) -> PayloadRecord {
        self.payload.region.load().decode()
    }

    pub fn write(&mut self, record: &PayloadRecord) -> Result<()> {
        let raw = RawPayload::encode(record)?;
        self.payload.region.store(&raw);
        Ok(())
    }

    /// Rotate the stored message in place without decoding it.
    pub fn rotate_in_place(&mut self) -> RawPayload {
        let mut raw = self.payload.region.load();
        raw.rotate_message();
        self.payload.region.store(&raw);
        raw
    }

    /// Leave the critical section, reporting a failed release.
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.payload.mutex.release()
    }
}

impl<R: SharedRegion, M: NamedMutex> Drop for PayloadGuard<'_, R, M> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.payload.mutex.release() {
                error!("Failed to release payload mutex: {}", e);
            }
        }
    }
}
