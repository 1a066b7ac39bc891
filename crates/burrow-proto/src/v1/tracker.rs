//! Tunnel presence records.

use super::Validate;
use super::info::AgentDescriptor;
use crate::error::ValidationError;

/// One registered tunnel, as published to the presence tracker.
///
/// `broker_url` is the private API URL of the broker instance holding the
/// tunnel; other instances use it to route requests there.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TunnelInfo {
    #[prost(message, optional, tag = "1")]
    pub agent_descriptor: Option<AgentDescriptor>,
    #[prost(int64, tag = "2")]
    pub connection_id: i64,
    #[prost(int64, tag = "3")]
    pub agent_id: i64,
    #[prost(string, tag = "4")]
    pub broker_url: String,
}

impl Validate for TunnelInfo {
    fn validate(&self) -> Result<(), ValidationError> {
        self.agent_descriptor
            .as_ref()
            .ok_or(ValidationError::Required {
                field: "TunnelInfo.AgentDescriptor",
            })?
            .validate()?;
        let url = self.broker_url.as_str();
        if !(url.is_empty() || url.starts_with("grpc://") || url.starts_with("grpcs://")) {
            return Err(ValidationError::UrlScheme {
                field: "TunnelInfo.BrokerUrl",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn info(url: &str) -> TunnelInfo {
        TunnelInfo {
            agent_descriptor: Some(AgentDescriptor::default()),
            connection_id: 1,
            agent_id: 2,
            broker_url: url.into(),
        }
    }

    #[test]
    fn valid_urls() {
        for url in ["", "grpc://1.1.1.1:10", "grpcs://1.1.1.1:10"] {
            assert_eq!(info(url).validate(), Ok(()), "{url}");
        }
    }

    #[test]
    fn other_scheme_is_invalid() {
        let err = info("tcp://1.1.1.1:12").validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid TunnelInfo.BrokerUrl: URL scheme must be grpc or grpcs"
        );
    }

    #[test]
    fn agent_descriptor_is_required() {
        let err = TunnelInfo::default().validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid TunnelInfo.AgentDescriptor: value is required"
        );
    }
}
