//! Shared test utilities for broker and job-store testing
//!
//! This crate provides reusable test infrastructure for the workspace crates:
//! - `TestMongo`: MongoDB container with automatic cleanup (feature: "mongo")
//! - `TestRabbitMq`: RabbitMQ container with automatic cleanup (feature: "rabbitmq")
//! - `TestDataBuilder`: Deterministic test data generation (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `mongo`: Enables MongoDB test infrastructure
//! - `rabbitmq`: Enables RabbitMQ test infrastructure
//! - `all`: Enables both
//!
//! Container-backed tests need Docker and are marked `#[ignore]`; run them with
//! `cargo test -- --ignored`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestMongo, TestDataBuilder};
//!
//! #[tokio::test]
//! #[ignore = "requires docker"]
//! async fn my_mongo_test() {
//!     let mongo = TestMongo::new().await;
//!     let builder = TestDataBuilder::from_test_name("my_test");
//!
//!     let payload = builder.job_payload();
//!     let db = mongo.database(&builder.name("db", "jobs"));
//! }
//! ```

use serde_json::{Value, json};
use uuid::Uuid;

#[cfg(feature = "mongo")]
mod mongo;

#[cfg(feature = "rabbitmq")]
mod rabbitmq;

#[cfg(feature = "mongo")]
pub use mongo::TestMongo;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::TestRabbitMq;

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by using seeded random data.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_submit_job");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    fn uuid_with_salt(&self, salt: u64) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let salted = (self.seed ^ salt).to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&salted);
        Uuid::from_bytes(uuid_bytes)
    }

    /// Deterministic user ID
    pub fn user_id(&self) -> Uuid {
        self.uuid_with_salt(0)
    }

    /// Deterministic workspace ID, distinct from `user_id`
    pub fn workspace_id(&self) -> Uuid {
        self.uuid_with_salt(0x5753_5041_4345)
    }

    /// Minimal job payload carrying tenant attribution
    pub fn job_payload(&self) -> Value {
        json!({
            "userId": self.user_id().to_string(),
            "workspaceId": self.workspace_id().to_string(),
        })
    }

    /// Job payload with extra fields merged in
    pub fn job_payload_with(&self, extra: Value) -> Value {
        let mut payload = self.job_payload();
        if let (Some(target), Value::Object(fields)) = (payload.as_object_mut(), extra) {
            target.extend(fields);
        }
        payload
    }

    /// Generate a unique name for testing
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("my_test");
    /// let name = builder.name("db", "jobs");
    /// // Returns: "test-db-12345-jobs"
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Poll `check` until it returns true or the timeout elapses
    pub async fn eventually<F>(timeout: std::time::Duration, mut check: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check() {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met within {:?}", timeout);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_builder_deterministic() {
        let builder1 = TestDataBuilder::new(42);
        let builder2 = TestDataBuilder::new(42);

        assert_eq!(builder1.user_id(), builder2.user_id());
        assert_eq!(builder1.name("db", "test"), builder2.name("db", "test"));
    }

    #[test]
    fn test_data_builder_different_names() {
        let builder1 = TestDataBuilder::from_test_name("test1");
        let builder2 = TestDataBuilder::from_test_name("test2");

        assert_ne!(builder1.user_id(), builder2.user_id());
    }

    #[test]
    fn test_workspace_differs_from_user() {
        let builder = TestDataBuilder::new(7);
        assert_ne!(builder.user_id(), builder.workspace_id());
    }

    #[test]
    fn test_job_payload() {
        let builder = TestDataBuilder::new(7);
        let payload = builder.job_payload_with(json!({ "marketplaceId": "m-1" }));

        assert_eq!(payload["userId"], builder.user_id().to_string());
        assert_eq!(payload["workspaceId"], builder.workspace_id().to_string());
        assert_eq!(payload["marketplaceId"], "m-1");
    }
}
