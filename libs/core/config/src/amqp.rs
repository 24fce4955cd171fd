use crate::{ConfigError, FromEnv, env_or_default, env_parse, env_required_any};
use std::time::Duration;

/// AMQP broker configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmqpConfig {
    pub url: String,
    /// Shown in the broker management UI
    pub connection_name: String,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Unacknowledged deliveries per consumer
    pub prefetch: u16,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_name: "marketplace-jobs".to_string(),
            reconnect_base_delay: Duration::from_millis(5000),
            max_reconnect_attempts: 10,
            prefetch: 1,
        }
    }

    /// URL with any password masked, for logs
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        match rest.split_once('@') {
            Some((credentials, host)) => {
                let user = credentials.split(':').next().unwrap_or_default();
                format!("{}://{}:***@{}", scheme, user, host)
            }
            None => self.url.clone(),
        }
    }
}

impl FromEnv for AmqpConfig {
    /// - AMQP_URL (falls back to RABBITMQ_URL): required
    /// - AMQP_CONNECTION_NAME: defaults to "marketplace-jobs"
    /// - AMQP_RECONNECT_BASE_DELAY_MS: defaults to 5000
    /// - AMQP_MAX_RECONNECT_ATTEMPTS: defaults to 10
    /// - AMQP_PREFETCH: defaults to 1
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: env_required_any(&["AMQP_URL", "RABBITMQ_URL"])?,
            connection_name: env_or_default("AMQP_CONNECTION_NAME", "marketplace-jobs"),
            reconnect_base_delay: Duration::from_millis(env_parse(
                "AMQP_RECONNECT_BASE_DELAY_MS",
                5000u64,
            )?),
            max_reconnect_attempts: env_parse("AMQP_MAX_RECONNECT_ATTEMPTS", 10)?,
            prefetch: env_parse("AMQP_PREFETCH", 1)?,
        })
    }
}
