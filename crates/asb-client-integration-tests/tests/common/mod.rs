//! Common test utilities for the asb-client integration tests

use asb_client::{
    ClientIdentity, EntityKind, InMemoryServiceBus, MemoryConfig, ServiceBusClient,
};
use std::sync::Arc;

pub const KEY_NAME: &str = "RootManageSharedAccessKey";
pub const KEY: &str = "gC9nJzD3UoxDP8LvQWkQihlvb6dBHpdxh7hXj3Trk5s=";

/// Emulator that verifies every signature against [`KEY_NAME`] / [`KEY`].
pub fn verifying_bus() -> InMemoryServiceBus {
    InMemoryServiceBus::new(MemoryConfig::default().with_credentials(KEY_NAME, KEY))
}

#[allow(dead_code)]
pub fn queue_client(bus: &InMemoryServiceBus) -> ServiceBusClient {
    let identity = ClientIdentity::new(EntityKind::Queue, "tester", KEY_NAME, KEY);
    ServiceBusClient::with_transport(identity, Arc::new(bus.clone()))
        .expect("valid queue identity")
}

#[allow(dead_code)]
pub fn topic_client(bus: &InMemoryServiceBus, subscription: Option<&str>) -> ServiceBusClient {
    let mut identity = ClientIdentity::new(EntityKind::Topic, "tester", KEY_NAME, KEY);
    if let Some(subscription) = subscription {
        identity = identity.with_subscription(subscription);
    }
    ServiceBusClient::with_transport(identity, Arc::new(bus.clone()))
        .expect("valid topic identity")
}
