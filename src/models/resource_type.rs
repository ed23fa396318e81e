//! Resource types managed by the control plane and their fixed dependency model
//!
//! The registry is closed: every type is known at compile time together with
//! the ordered list of types that depend on it. Cascade expansion walks this
//! graph breadth-first.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Tenant,
    Platform,
    ServiceBroker,
    ServiceInstance,
    ServiceBinding,
}

/// Static metadata describing how operations against a resource type behave
#[derive(Debug)]
pub struct ResourceTypeInfo {
    pub resource_type: ResourceType,
    /// URL collection segment, e.g. `service_instances`
    pub collection: &'static str,
    /// Types owned by this type, in expansion order
    pub dependents: &'static [ResourceType],
    /// Actions go through the owning service broker rather than local storage
    pub broker_backed: bool,
    /// Re-issuing the action after a restart cannot duplicate side effects
    pub reschedulable: bool,
}

static TENANT: ResourceTypeInfo = ResourceTypeInfo {
    resource_type: ResourceType::Tenant,
    collection: "tenants",
    dependents: &[
        ResourceType::Platform,
        ResourceType::ServiceBroker,
        ResourceType::ServiceInstance,
    ],
    broker_backed: false,
    reschedulable: true,
};

static PLATFORM: ResourceTypeInfo = ResourceTypeInfo {
    resource_type: ResourceType::Platform,
    collection: "platforms",
    dependents: &[ResourceType::ServiceInstance],
    broker_backed: false,
    reschedulable: true,
};

static SERVICE_BROKER: ResourceTypeInfo = ResourceTypeInfo {
    resource_type: ResourceType::ServiceBroker,
    collection: "service_brokers",
    dependents: &[ResourceType::ServiceInstance],
    broker_backed: false,
    reschedulable: true,
};

static SERVICE_INSTANCE: ResourceTypeInfo = ResourceTypeInfo {
    resource_type: ResourceType::ServiceInstance,
    collection: "service_instances",
    dependents: &[ResourceType::ServiceBinding],
    broker_backed: true,
    reschedulable: false,
};

static SERVICE_BINDING: ResourceTypeInfo = ResourceTypeInfo {
    resource_type: ResourceType::ServiceBinding,
    collection: "service_bindings",
    dependents: &[],
    broker_backed: true,
    reschedulable: false,
};

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Tenant,
        ResourceType::Platform,
        ResourceType::ServiceBroker,
        ResourceType::ServiceInstance,
        ResourceType::ServiceBinding,
    ];

    pub fn info(self) -> &'static ResourceTypeInfo {
        match self {
            ResourceType::Tenant => &TENANT,
            ResourceType::Platform => &PLATFORM,
            ResourceType::ServiceBroker => &SERVICE_BROKER,
            ResourceType::ServiceInstance => &SERVICE_INSTANCE,
            ResourceType::ServiceBinding => &SERVICE_BINDING,
        }
    }

    pub fn dependents(self) -> &'static [ResourceType] {
        self.info().dependents
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Tenant => "tenant",
            ResourceType::Platform => "platform",
            ResourceType::ServiceBroker => "service_broker",
            ResourceType::ServiceInstance => "service_instance",
            ResourceType::ServiceBinding => "service_binding",
        }
    }

    /// Look a type up by its URL collection segment
    pub fn from_collection(collection: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|rt| rt.info().collection == collection)
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|rt| rt.as_str() == s)
            .ok_or_else(|| format!("Unknown resource type: {}", s))
    }
}
