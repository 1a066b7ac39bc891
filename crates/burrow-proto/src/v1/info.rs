//! What an agent can serve through its tunnels.

use super::Validate;
use crate::error::ValidationError;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AgentDescriptor {
    #[prost(message, repeated, tag = "1")]
    pub services: Vec<Service>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Service {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub methods: Vec<Method>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Method {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl AgentDescriptor {
    /// Whether the agent serves `method` of `service`.
    pub fn supports_service_and_method(&self, service: &str, method: &str) -> bool {
        self.services
            .iter()
            .filter(|s| s.name == service)
            .any(|s| s.methods.iter().any(|m| m.name == method))
    }
}

/// Split a full gRPC method path (`/pkg.Service/Method`) into service and
/// method names.
pub fn split_method_name(full: &str) -> Option<(&str, &str)> {
    let (service, method) = full.strip_prefix('/')?.split_once('/')?;
    if service.is_empty() || method.is_empty() || method.contains('/') {
        return None;
    }
    Some((service, method))
}

impl Validate for AgentDescriptor {
    fn validate(&self) -> Result<(), ValidationError> {
        self.services.iter().try_for_each(Validate::validate)
    }
}

impl Validate for Service {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::Empty {
                field: "Service.Name",
            });
        }
        self.methods.iter().try_for_each(Validate::validate)
    }
}

impl Validate for Method {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::Empty {
                field: "Method.Name",
            });
        }
        Ok(())
    }
}
