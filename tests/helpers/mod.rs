//! Shared helpers for conversation tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use msb::config::{MsbConfig, ServiceDetailsConfig};
use msb::{MemoryBroker, MsbContext};

/// Instance id of contexts built by [`context`].
pub const INSTANCE_ID: &str = "it-1";

/// Context with a fixed instance id on `broker`.
pub fn context(broker: &MemoryBroker) -> MsbContext {
    MsbContext::builder()
        .config(MsbConfig {
            service_details: ServiceDetailsConfig {
                name: "integration".to_string(),
                version: "0.0.0".to_string(),
                instance_id: Some(INSTANCE_ID.to_string()),
            },
            ..MsbConfig::default()
        })
        .adapter(Arc::new(broker.clone()))
        .build()
        .expect("context should build")
}

/// Response topic requests to `namespace` are answered on.
pub fn response_topic(namespace: &str) -> String {
    format!("{namespace}:response:{INSTANCE_ID}")
}

/// Poll `condition` for up to two seconds.
pub fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met within 2s");
}
