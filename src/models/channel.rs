//! Channel domain model: an upstream provider instance and its credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Tag identifying which outbound transformer a channel's requests go
/// through. The transformer itself is out of scope for this crate; the core
/// only needs the tag to dispatch to one (see `DESIGN.md`, "dynamic dispatch
/// over channel type").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAI,
    Anthropic,
    Bedrock,
    Vertex,
    Ollama,
    /// Catch-all for the many provider relabels operators configure.
    Other(String),
}

/// A single disabled API key, recorded with the reason it was cut off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisabledApiKey {
    pub key: String,
    pub disabled_at: DateTime<Utc>,
    pub error_code: Option<u16>,
    pub reason: String,
}

/// Four-part credential used by cloud-IAM-backed providers (Bedrock, Vertex).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudIamCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: String,
}

/// OAuth credential envelope. Refresh is an out-of-scope collaborator; the
/// core only ever reads the current access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The four credential shapes a channel can carry. `ApiKeys` is the common
/// case and the only one with real key-level auto-disable and rendezvous
/// selection; the others behave as a single synthetic key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    OAuth(OAuthCredentials),
    ApiKey(String),
    ApiKeys(Vec<String>),
    CloudIam(CloudIamCredentials),
}

impl Credentials {
    /// Flattens whatever credential shape this is into the ordered key list
    /// the rest of the core operates on. OAuth and cloud-IAM channels expose
    /// a single synthetic "key" so that `TraceStickyKeyProvider`'s contract
    /// ("return `credentials.APIKeys[0]`") holds uniformly.
    pub fn all_keys(&self) -> Vec<String> {
        match self {
            Credentials::OAuth(o) => vec![o.access_token.clone()],
            Credentials::ApiKey(k) => vec![k.clone()],
            Credentials::ApiKeys(keys) => keys.clone(),
            Credentials::CloudIam(c) => vec![c.access_key_id.clone()],
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, Credentials::OAuth(_))
    }
}

/// Ordered `from -> to` rewrite applied when a request names `from` but the
/// channel only advertises `to` in `supported_models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
    Archived,
}

impl ChannelStatus {
    /// The snake_case form stored in the `channel.status` column, matching
    /// this type's own `#[serde(rename_all = "snake_case")]` wire format.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Archived => "archived",
        }
    }
}

/// Result of a `delete_disabled_api_keys` call, mirroring the admin contract
/// in SPEC_FULL.md §6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteDisabledKeysOutcome {
    pub success: bool,
    /// Set to `"ONE_KEY_PRESERVED"` when the deletion would have emptied the
    /// key set and one victim key was restored instead.
    pub message: Option<&'static str>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelMutationError {
    #[error("cannot delete API keys for OAuth channels")]
    OAuthKeyDeletionRejected,
    #[error("api key must not be empty")]
    EmptyApiKey,
}

/// An upstream provider instance, as described in SPEC_FULL.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub base_url: String,
    pub credentials: Credentials,
    pub supported_models: Vec<String>,
    pub model_mappings: Vec<ModelMapping>,
    pub extra_model_prefix: Option<String>,
    pub disabled_api_keys: Vec<DisabledApiKey>,
    pub status: ChannelStatus,
    pub ordering_weight: i32,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    /// Raw JSON blob of provider-call overrides (temperature caps, extra
    /// headers, ...). Parsed lazily into `ChannelSnapshot::cached_override_params`;
    /// kept as text here since the schema is provider-specific and out of
    /// scope for this crate.
    pub override_params_raw: Option<String>,
}

impl Channel {
    /// All credential keys in configuration order, independent of disabled
    /// status.
    pub fn all_keys(&self) -> Vec<String> {
        self.credentials.all_keys()
    }

    fn disabled_key_set(&self) -> HashSet<&str> {
        self.disabled_api_keys.iter().map(|d| d.key.as_str()).collect()
    }

    /// `all_keys() \ disabled_keys`, in configuration order. This is the set
    /// cached on `ChannelSnapshot` as `cached_enabled_api_keys`.
    pub fn enabled_keys(&self) -> Vec<String> {
        let disabled = self.disabled_key_set();
        self.all_keys()
            .into_iter()
            .filter(|k| !disabled.contains(k.as_str()))
            .collect()
    }

    /// Idempotently disables `key`: disabling an already-disabled key is a
    /// no-op; disabling a key the channel doesn't have is silently ignored.
    /// If this empties the enabled set, the channel itself transitions to
    /// `Disabled` with a human-readable `error_message`.
    ///
    /// Returns `true` if the channel transitioned to disabled as a result.
    pub fn disable_api_key(
        &mut self,
        key: &str,
        error_code: Option<u16>,
        reason: impl Into<String>,
    ) -> Result<bool, ChannelMutationError> {
        if key.is_empty() {
            return Err(ChannelMutationError::EmptyApiKey);
        }
        if !self.all_keys().iter().any(|k| k == key) {
            return Ok(false);
        }
        if self.disabled_key_set().contains(key) {
            return Ok(false);
        }
        self.disabled_api_keys.push(DisabledApiKey {
            key: key.to_string(),
            disabled_at: Utc::now(),
            error_code,
            reason: reason.into(),
        });

        if self.enabled_keys().is_empty() {
            self.status = ChannelStatus::Disabled;
            let last = error_code
                .map(|c| format!("All API keys disabled (last error: {})", c))
                .unwrap_or_else(|| "All API keys disabled".to_string());
            self.error_message = Some(last);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Removes `keys` from both `disabled_api_keys` and the credential set,
    /// enforcing invariant (i): a non-OAuth channel always keeps at least one
    /// API key reachable. If the literal deletion would empty the key set,
    /// the first key named in `keys` (the literal contract from
    /// SPEC_FULL.md §9, not necessarily the first non-disabled key) is
    /// restored and the outcome is flagged `ONE_KEY_PRESERVED`.
    pub fn delete_disabled_api_keys(
        &mut self,
        keys: &[String],
    ) -> Result<DeleteDisabledKeysOutcome, ChannelMutationError> {
        if self.credentials.is_oauth() {
            return Err(ChannelMutationError::OAuthKeyDeletionRejected);
        }

        let to_delete: HashSet<&str> = keys.iter().map(|s| s.as_str()).collect();
        let remaining: Vec<String> = self
            .all_keys()
            .into_iter()
            .filter(|k| !to_delete.contains(k.as_str()))
            .collect();

        let preserved = remaining.is_empty() && !keys.is_empty();
        let kept_keys = if preserved {
            vec![keys[0].clone()]
        } else {
            remaining
        };

        if let Credentials::ApiKeys(ref mut v) = self.credentials {
            *v = kept_keys.clone();
        } else if let Credentials::ApiKey(ref mut k) = self.credentials {
            if let Some(first) = kept_keys.first() {
                *k = first.clone();
            }
        }

        self.disabled_api_keys.retain(|d| !to_delete.contains(d.key.as_str()));

        Ok(DeleteDisabledKeysOutcome {
            success: true,
            message: if preserved { Some("ONE_KEY_PRESERVED") } else { None },
        })
    }

    /// Resolution per SPEC_FULL.md §4.9: exact match, extra-prefix match, or
    /// model-mapping match.
    pub fn resolve_model(&self, requested: &str) -> Option<String> {
        if self.supported_models.iter().any(|m| m == requested) {
            return Some(requested.to_string());
        }
        if let Some(prefix) = &self.extra_model_prefix {
            if let Some(stripped) = requested.strip_prefix(&format!("{}/", prefix)) {
                if self.supported_models.iter().any(|m| m == stripped) {
                    return Some(stripped.to_string());
                }
            }
        }
        for mapping in &self.model_mappings {
            if mapping.from == requested && self.supported_models.iter().any(|m| m == &mapping.to)
            {
                return Some(mapping.to.clone());
            }
        }
        None
    }

    pub fn is_model_supported(&self, requested: &str) -> bool {
        self.resolve_model(requested).is_some()
    }
}
