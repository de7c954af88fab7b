//! Credential resolution for worker capability tokens.
//!
//! A worker authenticates to the model API with either an API key or an
//! OAuth token. Resolution is independent of the chosen backend: explicit
//! environment lookup first, then an optional secret store consumed
//! through the narrow [`SecretStore`] interface. Adapters never read
//! credentials from ambient globals — resolved values are threaded into
//! launch explicitly, which is also what makes "no secrets in payload
//! text" checkable.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// How the worker authenticates to the model API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    ApiKey,
    Oauth,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::ApiKey => "api_key",
            AuthType::Oauth => "oauth",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api_key" => Ok(AuthType::ApiKey),
            "oauth" => Ok(AuthType::Oauth),
            other => Err(format!(
                "invalid auth type '{other}' (expected 'api_key' or 'oauth')"
            )),
        }
    }
}

/// API keys look like `sk-ant-api03-...`.
pub fn validate_api_key(key: &str) -> bool {
    key.starts_with("sk-ant-api")
}

/// OAuth access tokens look like `sk-ant-oat01-...`.
pub fn validate_oauth_token(token: &str) -> bool {
    token.starts_with("sk-ant-oat")
}

/// OAuth credential material, as stored in the `claudeAiOauth` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredentials {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl OAuthCredentials {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OAuthEnvelope {
    #[serde(rename = "claudeAiOauth")]
    claude_ai_oauth: OAuthCredentials,
}

/// Parse an OAuth credentials JSON document.
///
/// Returns `None` for invalid JSON or a document without the
/// `claudeAiOauth` key — both mean "no usable credentials here".
pub fn parse_oauth_credentials_json(raw: &str) -> Option<OAuthCredentials> {
    serde_json::from_str::<OAuthEnvelope>(raw)
        .ok()
        .map(|envelope| envelope.claude_ai_oauth)
}

/// Serialize OAuth credentials back into the envelope format the worker's
/// CLI expects in `~/.claude/.credentials.json`.
pub fn generate_credentials_json(oauth: &OAuthCredentials) -> String {
    serde_json::to_string(&OAuthEnvelope {
        claude_ai_oauth: oauth.clone(),
    })
    .expect("oauth envelope serializes")
}

/// Resolved capability token, one variant populated per auth type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub auth_type: AuthType,
    pub api_key: Option<String>,
    pub oauth: Option<OAuthCredentials>,
}

impl Credentials {
    pub fn from_api_key(key: impl Into<String>) -> Self {
        Self {
            auth_type: AuthType::ApiKey,
            api_key: Some(key.into()),
            oauth: None,
        }
    }

    pub fn from_oauth(oauth: OAuthCredentials) -> Self {
        Self {
            auth_type: AuthType::Oauth,
            api_key: None,
            oauth: Some(oauth),
        }
    }

    pub fn from_oauth_json(raw: &str) -> Option<Self> {
        parse_oauth_credentials_json(raw).map(Self::from_oauth)
    }

    /// Key/value pairs for an instance-metadata-equivalent side channel
    /// (GCP metadata attributes, AWS SSM). The booted unit reads these at
    /// run time; they never appear in payload text.
    pub fn side_channel_items(&self) -> Vec<(String, String)> {
        let mut items = vec![("auth-type".to_string(), self.auth_type.to_string())];
        match self.auth_type {
            AuthType::ApiKey => {
                if let Some(key) = &self.api_key {
                    items.push(("anthropic-api-key".to_string(), key.clone()));
                }
            }
            AuthType::Oauth => {
                if let Some(oauth) = &self.oauth {
                    items.push((
                        "oauth-credentials".to_string(),
                        generate_credentials_json(oauth),
                    ));
                }
            }
        }
        items
    }

    /// The same material as one JSON object, for side channels that hold a
    /// single value (an SSM parameter).
    pub fn side_channel_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .side_channel_items()
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        serde_json::Value::Object(map).to_string()
    }

    /// Environment variables for container/managed backends, where the
    /// unit's environment is the side channel.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![("AUTH_TYPE".to_string(), self.auth_type.to_string())];
        match self.auth_type {
            AuthType::ApiKey => {
                if let Some(key) = &self.api_key {
                    vars.push(("ANTHROPIC_API_KEY".to_string(), key.clone()));
                }
            }
            AuthType::Oauth => {
                if let Some(oauth) = &self.oauth {
                    vars.push((
                        "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
                        oauth.access_token.clone(),
                    ));
                }
            }
        }
        vars
    }

    /// Every literal secret value this credential carries, for tests that
    /// scan generated artifacts.
    pub fn secret_values(&self) -> Vec<String> {
        let mut values = Vec::new();
        if let Some(key) = &self.api_key {
            values.push(key.clone());
        }
        if let Some(oauth) = &self.oauth {
            values.push(oauth.access_token.clone());
            if let Some(refresh) = &oauth.refresh_token {
                values.push(refresh.clone());
            }
        }
        values
    }
}

/// Narrow interface to a secret store. Concrete backends (cloud secret
/// managers, keychains) are external collaborators.
pub trait SecretStore {
    fn get(&self, name: &str) -> Result<Option<String>>;
    fn set(&self, name: &str, value: &str) -> Result<()>;
}

/// Resolve credentials for the given auth type.
///
/// Environment lookup wins; the secret store (when present) is the
/// fallback. Returns `Ok(None)` when neither source has anything — the
/// caller decides how to surface that.
pub fn resolve_credentials(
    auth_type: AuthType,
    env: &dyn Fn(&str) -> Option<String>,
    secrets: Option<&dyn SecretStore>,
    api_key_secret: &str,
    oauth_secret: &str,
) -> Result<Option<Credentials>> {
    match auth_type {
        AuthType::ApiKey => {
            if let Some(key) = env("ANTHROPIC_API_KEY").filter(|v| !v.is_empty()) {
                return Ok(Some(Credentials::from_api_key(key)));
            }
            if let Some(store) = secrets
                && let Some(key) = store.get(api_key_secret)?
            {
                return Ok(Some(Credentials::from_api_key(key)));
            }
            Ok(None)
        }
        AuthType::Oauth => {
            if let Some(token) = env("CLAUDE_CODE_OAUTH_TOKEN").filter(|v| !v.is_empty()) {
                return Ok(Some(Credentials::from_oauth(OAuthCredentials::new(token))));
            }
            if let Some(store) = secrets
                && let Some(raw) = store.get(oauth_secret)?
            {
                return Ok(Credentials::from_oauth_json(&raw));
            }
            Ok(None)
        }
    }
}
