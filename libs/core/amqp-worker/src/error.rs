//! Broker error types and error categorization
//!
//! Errors are categorized to decide how the connection manager reacts:
//! - **Connectivity**: the connection or channel is gone, schedule a reconnect
//! - **Publish**: the broker rejected or back-pressured a publish
//! - **Protocol**: everything else the broker refused (bad topology, unknown queue)

use thiserror::Error;

/// Category of broker error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection or channel lost, recoverable through reconnection
    Connectivity,
    /// Publish refused by the broker
    Publish,
    /// Broker refused a declaration, consume or cancel
    Protocol,
}

/// Broker errors
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Error reported by the lapin client
    #[error("AMQP error: {0}")]
    Lapin(#[from] lapin::Error),

    /// Could not establish a connection
    #[error("Connection error: {0}")]
    Connection(String),

    /// No live channel (degraded mode)
    #[error("Broker connection is not initialized")]
    NotConnected,

    /// Publish failed or was negatively confirmed
    #[error("Publish error: {0}")]
    Publish(String),

    /// Exchange/queue/binding declaration failed
    #[error("Topology error: {0}")]
    Topology(String),

    /// Consume or cancel failed
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Reconnection gave up
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
}

impl AmqpError {
    pub fn connection(message: impl Into<String>) -> Self {
        AmqpError::Connection(message.into())
    }

    pub fn publish(message: impl Into<String>) -> Self {
        AmqpError::Publish(message.into())
    }

    pub fn topology(message: impl Into<String>) -> Self {
        AmqpError::Topology(message.into())
    }

    pub fn consumer(message: impl Into<String>) -> Self {
        AmqpError::Consumer(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            AmqpError::Lapin(e) => {
                if matches!(
                    e,
                    lapin::Error::IOError(_)
                        | lapin::Error::InvalidConnectionState(_)
                        | lapin::Error::InvalidChannelState(_)
                        | lapin::Error::MissingHeartbeatError
                ) {
                    ErrorCategory::Connectivity
                } else {
                    ErrorCategory::Protocol
                }
            }
            AmqpError::Connection(_) => ErrorCategory::Connectivity,
            AmqpError::NotConnected => ErrorCategory::Connectivity,
            AmqpError::ReconnectExhausted { .. } => ErrorCategory::Connectivity,
            AmqpError::Publish(_) => ErrorCategory::Publish,
            AmqpError::Topology(_) => ErrorCategory::Protocol,
            AmqpError::Consumer(_) => ErrorCategory::Protocol,
        }
    }

    /// Check if this error means the connection is gone
    pub fn is_connection_error(&self) -> bool {
        self.category() == ErrorCategory::Connectivity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            AmqpError::connection("refused").category(),
            ErrorCategory::Connectivity
        );
        assert_eq!(AmqpError::NotConnected.category(), ErrorCategory::Connectivity);
        assert_eq!(AmqpError::publish("nack").category(), ErrorCategory::Publish);
        assert_eq!(
            AmqpError::topology("PRECONDITION_FAILED").category(),
            ErrorCategory::Protocol
        );
    }

    #[test]
    fn test_is_connection_error() {
        assert!(AmqpError::ReconnectExhausted { attempts: 10 }.is_connection_error());
        assert!(!AmqpError::consumer("unknown queue").is_connection_error());
    }

    #[test]
    fn test_display() {
        let err = AmqpError::ReconnectExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "Reconnect attempts exhausted after 3 tries");
    }
}
