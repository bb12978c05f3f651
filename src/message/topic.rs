//! Topic naming rules.
//!
//! Topics are colon-delimited lowercase segments such as `orders:create`.
//! A leading underscore marks an internal service topic.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{MsbError, MsbResult};

static TOPIC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^_?([a-z0-9\-]+:)+([a-z0-9\-]+)$").expect("valid regex for topic grammar")
});

/// Check that `topic` follows the topic grammar.
pub fn validate_topic(topic: &str) -> MsbResult<()> {
    if TOPIC_PATTERN.is_match(topic) {
        Ok(())
    } else {
        Err(MsbError::invalid_topic(topic))
    }
}

/// Whether `topic` is an internal service topic.
pub fn is_service_topic(topic: &str) -> bool {
    topic.starts_with('_')
}

/// Private response topic of one service instance for requests on `namespace`.
pub fn response_topic(namespace: &str, instance_id: &str) -> String {
    format!("{namespace}:response:{instance_id}")
}
