//! Wire vocabulary shared by the service and its clients.
//!
//! The application protocol is three literals plus the client's base name:
//!
//! ```text
//! client                          registration queue          service
//!   |-- "<base>" (prio 0..=10) ------------>|--------------------->|
//!   |<------------------ "ack" ---- /mq_received_by_<base> --------|
//!   |   (write message+shift under mutex)                          |
//!   |-- "caesar" ---------------- /mq_sent_from_<base> ----------->|
//!   |                               (rotate payload under mutex)   |
//!   |<------------------ "fin" ---- /mq_received_by_<base> --------|
//!   |   (read payload under mutex, unlink both channels)           |
//! ```

use crate::config::IpcConfig;
use crate::error::{CaesarError, Result};
use crate::registry::QueueMessage;

/// One of the fixed protocol literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlWord {
    /// Service → client: registration accepted.
    Ack,
    /// Client → service: payload is ready, rotate it.
    Caesar,
    /// Service → client: payload has been rotated.
    Fin,
}

impl ControlWord {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlWord::Ack => "ack",
            ControlWord::Caesar => "caesar",
            ControlWord::Fin => "fin",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// Exact match only; trailing NUL terminators are ignored.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "ack" => Some(ControlWord::Ack),
            "caesar" => Some(ControlWord::Caesar),
            "fin" => Some(ControlWord::Fin),
            _ => None,
        }
    }

    /// Require that `message` is exactly this word.
    pub fn expect_in(self, message: &QueueMessage) -> Result<()> {
        let text = message.text();
        if ControlWord::parse(&text) == Some(self) {
            Ok(())
        } else {
            Err(CaesarError::Protocol {
                expected: self.as_str(),
                received: text,
            })
        }
    }
}

impl std::fmt::Display for ControlWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Check a client base name.
///
/// Base names must fit behind either channel prefix, and must not contain
/// `/`, NUL or whitespace.
pub fn validate_base_name(base: &str) -> Result<()> {
    let problem = if base.is_empty() {
        Some("base name must not be empty".to_string())
    } else if base.len() > IpcConfig::MAX_BASE_NAME_LEN {
        Some(format!(
            "base name is {} bytes, maximum is {}",
            base.len(),
            IpcConfig::MAX_BASE_NAME_LEN
        ))
    } else if base.contains('/') {
        Some("base name must not contain '/'".to_string())
    } else if base.chars().any(|c| c == '\0' || c.is_whitespace()) {
        Some("base name must not contain NUL or whitespace".to_string())
    } else {
        None
    };

    match problem {
        Some(message) => Err(CaesarError::Validation {
            field: "base_name".to_string(),
            message,
        }),
        None => Ok(()),
    }
}

/// The two queue names derived from a client's base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub base: String,
    /// Service → client (`ack`, `fin`).
    pub receive: String,
    /// Client → service (`caesar`).
    pub send: String,
}

impl ChannelNames {
    pub fn for_client(base: &str) -> Result<Self> {
        validate_base_name(base)?;
        Ok(Self::derive(base))
    }

    /// Channel names for a base name that has already been validated.
    fn derive(base: &str) -> Self {
        Self {
            base: base.to_string(),
            receive: format!("{}{}", IpcConfig::RECEIVE_PREFIX, base),
            send: format!("{}{}", IpcConfig::SEND_PREFIX, base),
        }
    }
}

/// A client announcing itself on the registration queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub base_name: String,
    pub priority: u32,
}

impl Registration {
    pub fn new(base_name: impl Into<String>, priority: u32) -> Result<Self> {
        let base_name = base_name.into();
        validate_base_name(&base_name)?;
        if priority > IpcConfig::MAX_PRIORITY {
            return Err(CaesarError::Validation {
                field: "priority".to_string(),
                message: format!(
                    "priority {} is outside 0..={}",
                    priority,
                    IpcConfig::MAX_PRIORITY
                ),
            });
        }
        Ok(Self {
            base_name,
            priority,
        })
    }

    /// The bytes sent on the registration queue: the bare base name.
    pub fn encode(&self) -> &[u8] {
        self.base_name.as_bytes()
    }

    /// Decode a registration taken off the queue.
    ///
    /// The priority is the queue priority the message was sent with.
    pub fn decode(message: &QueueMessage) -> Result<Self> {
        let base_name = message.text();
        validate_base_name(&base_name).map_err(|e| CaesarError::InvalidRegistration {
            message: e.to_string(),
        })?;
        Ok(Self {
            base_name,
            priority: message.priority,
        })
    }

    pub fn channels(&self) -> ChannelNames {
        ChannelNames::derive(&self.base_name)
    }
}
