//! Credential storage for upstream providers.
//!
//! Credentials live in `~/.llmux/auth.json` as a JSON object mapping a
//! provider id to an ordered list of credentials. The gateway only reads
//! snapshots; interactive login flows are managed by external tooling and
//! are consumed here solely through the [`TokenRefresher`] contract.

mod store;

use jiff::Timestamp;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

pub use store::CredentialStore;

/// How long before expiry an OAuth token is considered stale and refreshed.
const REFRESH_MARGIN_SECONDS: i64 = 300;

/// A single credential entry for a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credential {
    /// Plain API key.
    Api {
        /// The key value sent in the provider's auth header.
        key: String,
    },
    /// OAuth token pair with optional account metadata.
    #[serde(rename_all = "camelCase")]
    Oauth {
        /// Bearer token for upstream requests.
        access_token: String,
        /// Token used to mint a new access token.
        refresh_token: String,
        /// Expiry of the access token, Unix milliseconds.
        expires_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        /// Account email, when the login flow reported one.
        email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        /// Provider-side account identifier.
        account_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        /// Cloud project the token is bound to.
        project_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        /// Quota project override for billing attribution.
        quota_project_id: Option<String>,
    },
}

impl Credential {
    /// The bearer token or API key for this credential.
    pub fn access_token(&self) -> SecretString {
        match self {
            Credential::Api { key } => SecretString::from(key.clone()),
            Credential::Oauth { access_token, .. } => SecretString::from(access_token.clone()),
        }
    }

    /// The project id bound to this credential, if any.
    pub fn project_id(&self) -> Option<&str> {
        match self {
            Credential::Api { .. } => None,
            Credential::Oauth {
                project_id,
                quota_project_id,
                ..
            } => project_id.as_deref().or(quota_project_id.as_deref()),
        }
    }

    /// Whether an OAuth token expires within the refresh margin.
    /// API keys never expire.
    pub fn needs_refresh(&self, now: Timestamp) -> bool {
        match self {
            Credential::Api { .. } => false,
            Credential::Oauth { expires_at, .. } => {
                *expires_at <= now.as_millisecond() + REFRESH_MARGIN_SECONDS * 1000
            }
        }
    }
}

/// Contract for refreshing expiring OAuth tokens.
///
/// The actual refresh flow (token endpoint, client ids) is owned by external
/// tooling; the store only invokes it and persists the result.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Exchange a refresh token for a fresh credential.
    async fn refresh(&self, provider: &str, credential: &Credential) -> anyhow::Result<Credential>;
}

/// Errors raised by the credential store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The auth file could not be read or written.
    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),
    /// The auth file is not valid JSON of the expected shape.
    #[error("credential file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_keys_never_need_refresh() {
        let credential = Credential::Api { key: "sk-test".into() };
        assert!(!credential.needs_refresh(Timestamp::MAX));
    }

    #[test]
    fn oauth_refresh_margin() {
        let now = Timestamp::UNIX_EPOCH;

        let fresh = Credential::Oauth {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: 600_000,
            email: None,
            account_id: None,
            project_id: None,
            quota_project_id: None,
        };
        assert!(!fresh.needs_refresh(now));

        let stale = Credential::Oauth {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: 200_000,
            email: None,
            account_id: None,
            project_id: None,
            quota_project_id: None,
        };
        assert!(stale.needs_refresh(now));
    }

    #[test]
    fn credential_round_trips_through_json() {
        let json = r#"{"type":"oauth","accessToken":"at","refreshToken":"rt","expiresAt":1000,"email":"a@b.c"}"#;
        let credential: Credential = serde_json::from_str(json).unwrap();

        insta::assert_json_snapshot!(credential, @r#"
        {
          "type": "oauth",
          "accessToken": "at",
          "refreshToken": "rt",
          "expiresAt": 1000,
          "email": "a@b.c"
        }
        "#);
    }
}
