//! Managed resources (tenants, platforms, brokers, instances, bindings)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::resources;
use crate::error::OperationError;
use crate::models::resource_type::ResourceType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub resource_type: ResourceType,
    /// Owning resource; dependents are looked up through this link
    pub owner_id: Option<String>,
    pub name: String,
    /// Broker serving a broker-backed resource
    pub broker_id: Option<String>,
    /// Base URL, only set on service brokers
    pub broker_url: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(resource_type: ResourceType, id: &str, name: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            resource_type,
            owner_id: None,
            name: name.to_string(),
            broker_id: None,
            broker_url: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owned_by(mut self, owner_id: &str) -> Self {
        self.owner_id = Some(owner_id.to_string());
        self
    }

    pub fn served_by(mut self, broker_id: &str) -> Self {
        self.broker_id = Some(broker_id.to_string());
        self
    }

    pub fn with_broker_url(mut self, url: &str) -> Self {
        self.broker_url = Some(url.to_string());
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl TryFrom<resources::Model> for Resource {
    type Error = OperationError;

    fn try_from(model: resources::Model) -> Result<Self, Self::Error> {
        let resource_type = model
            .resource_type
            .parse::<ResourceType>()
            .map_err(|e| OperationError::Validation(format!("resource {}: {}", model.id, e)))?;

        Ok(Self {
            id: model.id,
            resource_type,
            owner_id: model.owner_id,
            name: model.name,
            broker_id: model.broker_id,
            broker_url: model.broker_url,
            deleted_at: model.deleted_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }
}
