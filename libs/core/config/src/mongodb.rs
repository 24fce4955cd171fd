use crate::{ConfigError, FromEnv, env_or_default, env_required_any};

/// MongoDB configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

impl MongoConfig {
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
        }
    }
}

impl FromEnv for MongoConfig {
    /// Requires MONGODB_URI (or MONGO_URI); MONGODB_DATABASE defaults to "marketplace"
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            uri: env_required_any(&["MONGODB_URI", "MONGO_URI"])?,
            database: env_or_default("MONGODB_DATABASE", "marketplace"),
        })
    }
}
