//! Capability Configuration Decoding
//!
//! Each DON stores one opaque configuration blob per capability. The blob is a
//! protobuf `CapabilityConfig` message. Default and restricted configs are
//! `google.protobuf.Struct` values and surface here as JSON maps; at most one of the
//! remote trigger / remote target sub-configs is present.

use crate::error::ConfigError;
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::time::Duration;

/// Default interval between trigger registration refreshes
pub const DEFAULT_REGISTRATION_REFRESH: Duration = Duration::from_secs(30);
/// Default lifetime of a trigger registration that is not refreshed
pub const DEFAULT_REGISTRATION_EXPIRY: Duration = Duration::from_secs(120);
/// Default lifetime of unaggregated trigger events
pub const DEFAULT_MESSAGE_EXPIRY: Duration = Duration::from_secs(120);

/// Wire messages of the configuration blob
#[allow(missing_docs)]
pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct CapabilityConfig {
        #[prost(message, optional, tag = "1")]
        pub default_config: Option<::prost_types::Struct>,
        #[prost(oneof = "capability_config::RemoteConfig", tags = "2, 3")]
        pub remote_config: Option<capability_config::RemoteConfig>,
        #[prost(string, repeated, tag = "4")]
        pub restricted_keys: Vec<String>,
        #[prost(message, optional, tag = "5")]
        pub restricted_config: Option<::prost_types::Struct>,
    }

    pub mod capability_config {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum RemoteConfig {
            #[prost(message, tag = "2")]
            RemoteTriggerConfig(super::RemoteTriggerConfig),
            #[prost(message, tag = "3")]
            RemoteTargetConfig(super::RemoteTargetConfig),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RemoteTriggerConfig {
        #[prost(message, optional, tag = "1")]
        pub registration_refresh: Option<::prost_types::Duration>,
        #[prost(message, optional, tag = "2")]
        pub registration_expiry: Option<::prost_types::Duration>,
        #[prost(uint32, tag = "3")]
        pub min_responses_to_aggregate: u32,
        #[prost(message, optional, tag = "4")]
        pub message_expiry: Option<::prost_types::Duration>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct RemoteTargetConfig {
        #[prost(string, repeated, tag = "1")]
        pub request_hash_excluded_attributes: Vec<String>,
    }
}

/// Remote trigger settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTriggerConfig {
    /// How often subscribers re-send their registrations
    pub registration_refresh: Duration,
    /// How long a publisher keeps a registration without refresh
    pub registration_expiry: Duration,
    /// Distinct node responses required before aggregating an event
    pub min_responses_to_aggregate: u32,
    /// How long unaggregated events are retained
    pub message_expiry: Duration,
}

impl RemoteTriggerConfig {
    /// Replace zero-valued durations with the defaults
    ///
    /// `min_responses_to_aggregate` is left alone; the subscriber derives it from
    /// the capability DON when zero.
    pub fn apply_defaults(&mut self) {
        if self.registration_refresh.is_zero() {
            self.registration_refresh = DEFAULT_REGISTRATION_REFRESH;
        }
        if self.registration_expiry.is_zero() {
            self.registration_expiry = DEFAULT_REGISTRATION_EXPIRY;
        }
        if self.message_expiry.is_zero() {
            self.message_expiry = DEFAULT_MESSAGE_EXPIRY;
        }
    }
}

/// Remote target settings as stored on-chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTargetConfig {
    /// Dotted input paths ignored when hashing requests
    pub request_hash_excluded_attributes: Vec<String>,
}

/// Effective settings of an executable (action/target) server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteExecutableConfig {
    /// Dotted input paths ignored when hashing requests
    pub request_hash_excluded_attributes: Vec<String>,
}

impl From<&RemoteTargetConfig> for RemoteExecutableConfig {
    fn from(target: &RemoteTargetConfig) -> Self {
        Self {
            request_hash_excluded_attributes: target.request_hash_excluded_attributes.clone(),
        }
    }
}

/// Decoded capability configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityConfiguration {
    /// Config applied to every request
    pub default_config: Map<String, Value>,
    /// Keys callers may not override
    pub restricted_keys: Vec<String>,
    /// Values for the restricted keys
    pub restricted_config: Map<String, Value>,
    /// Remote trigger settings
    pub remote_trigger_config: Option<RemoteTriggerConfig>,
    /// Remote target settings
    pub remote_target_config: Option<RemoteTargetConfig>,
}

impl CapabilityConfiguration {
    /// Decode a configuration blob
    pub fn decode(data: &[u8]) -> Result<Self, ConfigError> {
        let raw = pb::CapabilityConfig::decode(data)?;

        let mut remote_trigger_config = None;
        let mut remote_target_config = None;
        match raw.remote_config {
            Some(pb::capability_config::RemoteConfig::RemoteTriggerConfig(t)) => {
                remote_trigger_config = Some(RemoteTriggerConfig {
                    registration_refresh: duration_from_proto(
                        t.registration_refresh,
                        "registration_refresh",
                    )?,
                    registration_expiry: duration_from_proto(
                        t.registration_expiry,
                        "registration_expiry",
                    )?,
                    min_responses_to_aggregate: t.min_responses_to_aggregate,
                    message_expiry: duration_from_proto(t.message_expiry, "message_expiry")?,
                });
            }
            Some(pb::capability_config::RemoteConfig::RemoteTargetConfig(t)) => {
                remote_target_config = Some(RemoteTargetConfig {
                    request_hash_excluded_attributes: t.request_hash_excluded_attributes,
                });
            }
            None => {}
        }

        Ok(Self {
            default_config: struct_to_map(raw.default_config)?,
            restricted_keys: raw.restricted_keys,
            restricted_config: struct_to_map(raw.restricted_config)?,
            remote_trigger_config,
            remote_target_config,
        })
    }

    /// Encode into a configuration blob
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let remote_config = if let Some(t) = &self.remote_trigger_config {
            Some(pb::capability_config::RemoteConfig::RemoteTriggerConfig(
                pb::RemoteTriggerConfig {
                    registration_refresh: Some(duration_to_proto(t.registration_refresh)),
                    registration_expiry: Some(duration_to_proto(t.registration_expiry)),
                    min_responses_to_aggregate: t.min_responses_to_aggregate,
                    message_expiry: Some(duration_to_proto(t.message_expiry)),
                },
            ))
        } else {
            self.remote_target_config.as_ref().map(|t| {
                pb::capability_config::RemoteConfig::RemoteTargetConfig(pb::RemoteTargetConfig {
                    request_hash_excluded_attributes: t.request_hash_excluded_attributes.clone(),
                })
            })
        };

        pb::CapabilityConfig {
            default_config: Some(map_to_struct(&self.default_config)),
            remote_config,
            restricted_keys: self.restricted_keys.clone(),
            restricted_config: Some(map_to_struct(&self.restricted_config)),
        }
        .encode_to_vec()
    }
}

fn duration_from_proto(
    d: Option<prost_types::Duration>,
    field: &'static str,
) -> Result<Duration, ConfigError> {
    match d {
        None => Ok(Duration::ZERO),
        Some(d) if d.seconds < 0 || d.nanos < 0 => Err(ConfigError::NegativeDuration { field }),
        Some(d) => Ok(Duration::new(d.seconds as u64, d.nanos as u32)),
    }
}

fn duration_to_proto(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

fn struct_to_map(s: Option<prost_types::Struct>) -> Result<Map<String, Value>, ConfigError> {
    let mut out = Map::new();
    if let Some(s) = s {
        for (k, v) in s.fields {
            out.insert(k, value_to_json(v)?);
        }
    }
    Ok(out)
}

fn value_to_json(v: prost_types::Value) -> Result<Value, ConfigError> {
    use prost_types::value::Kind;

    Ok(match v.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::NumberValue(n)) => {
            Value::Number(Number::from_f64(n).ok_or(ConfigError::NonFiniteNumber)?)
        }
        Some(Kind::StringValue(s)) => Value::String(s),
        Some(Kind::BoolValue(b)) => Value::Bool(b),
        Some(Kind::StructValue(s)) => Value::Object(struct_to_map(Some(s))?),
        Some(Kind::ListValue(l)) => Value::Array(
            l.values
                .into_iter()
                .map(value_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
    })
}

fn map_to_struct(map: &Map<String, Value>) -> prost_types::Struct {
    prost_types::Struct {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), json_to_value(v)))
            .collect(),
    }
}

fn json_to_value(v: &Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match v {
        Value::Null => Kind::NullValue(0),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        Value::Object(map) => Kind::StructValue(map_to_struct(map)),
    };
    prost_types::Value { kind: Some(kind) }
}
