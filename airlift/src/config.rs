//! Launcher configuration from environment variables.
//!
//! Configuration errors must surface before any remote call, with a
//! message naming the variable to fix. Parsing is driven through a lookup
//! function so tests never touch the real environment.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};

use crate::auth::AuthType;
use crate::provider::ProviderKind;

/// Default Ubuntu machine shape for GCE units.
const DEFAULT_MACHINE_TYPE: &str = "e2-medium";
/// Default EC2 instance shape.
const DEFAULT_AWS_INSTANCE_TYPE: &str = "t3.medium";
/// Default zone; region derives from it.
const DEFAULT_ZONE: &str = "us-central1-a";
/// Prebuilt worker image for container/managed backends.
const DEFAULT_WORKER_IMAGE: &str = "ghcr.io/airlift-dev/airlift-worker:latest";
/// Release URL the bootstrap script downloads the harness binary from.
const DEFAULT_HARNESS_URL: &str =
    "https://github.com/airlift-dev/airlift/releases/latest/download/airlift-harness-x86_64-unknown-linux-gnu";

/// Launcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub provider: ProviderKind,
    pub auth_type: AuthType,

    // GCP
    pub gcp_project: Option<String>,
    pub gcp_zone: String,
    pub machine_type: String,

    // AWS
    pub aws_region: String,
    pub aws_instance_type: String,
    /// IAM instance profile granting the unit S3 + SSM access.
    pub aws_instance_profile: Option<String>,

    // Railway
    pub railway_token: Option<String>,
    pub railway_project_id: Option<String>,

    // Docker
    pub docker_image: String,
    pub docker_data_dir: PathBuf,

    /// Object-store bucket for agent state (auto-named for GCP).
    pub bucket: Option<String>,
    /// Where units download the harness binary from.
    pub harness_url: String,
    /// Secret-store entry names for the credential resolver fallback.
    pub api_key_secret: String,
    pub oauth_secret: String,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env(
        provider_override: Option<&str>,
        auth_override: Option<&str>,
    ) -> Result<Self> {
        Self::from_env_with(
            &|name| std::env::var(name).ok().filter(|v| !v.is_empty()),
            provider_override,
            auth_override,
        )
    }

    /// Testable core of [`Config::from_env`]; `lookup` stands in for the
    /// environment.
    pub fn from_env_with(
        lookup: &dyn Fn(&str) -> Option<String>,
        provider_override: Option<&str>,
        auth_override: Option<&str>,
    ) -> Result<Self> {
        let provider_raw = provider_override
            .map(str::to_string)
            .or_else(|| lookup("AIRLIFT_PROVIDER"))
            .unwrap_or_else(|| "gcp".to_string());
        let provider = ProviderKind::from_str(&provider_raw)?;

        let auth_raw = auth_override
            .map(str::to_string)
            .or_else(|| lookup("AIRLIFT_AUTH_TYPE"))
            .unwrap_or_else(|| "api_key".to_string());
        let auth_type = AuthType::from_str(&auth_raw).map_err(|err| anyhow!(err))?;

        let gcp_project = lookup("AIRLIFT_PROJECT").or_else(|| lookup("GOOGLE_CLOUD_PROJECT"));
        let bucket = lookup("AIRLIFT_BUCKET").or_else(|| {
            // GCS bucket names are global; derive a stable per-project one.
            (provider == ProviderKind::Gcp)
                .then(|| gcp_project.as_ref().map(|p| format!("airlift-{p}")))
                .flatten()
        });

        let docker_data_dir = lookup("AIRLIFT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".airlift")
            });

        let config = Self {
            provider,
            auth_type,
            gcp_project,
            gcp_zone: lookup("AIRLIFT_ZONE").unwrap_or_else(|| DEFAULT_ZONE.to_string()),
            machine_type: lookup("AIRLIFT_MACHINE_TYPE")
                .unwrap_or_else(|| DEFAULT_MACHINE_TYPE.to_string()),
            aws_region: lookup("AIRLIFT_AWS_REGION")
                .or_else(|| lookup("AWS_REGION"))
                .unwrap_or_else(|| "us-east-1".to_string()),
            aws_instance_type: lookup("AIRLIFT_AWS_INSTANCE_TYPE")
                .unwrap_or_else(|| DEFAULT_AWS_INSTANCE_TYPE.to_string()),
            aws_instance_profile: lookup("AIRLIFT_AWS_INSTANCE_PROFILE"),
            railway_token: lookup("RAILWAY_TOKEN"),
            railway_project_id: lookup("RAILWAY_PROJECT_ID"),
            docker_image: lookup("AIRLIFT_DOCKER_IMAGE")
                .or_else(|| lookup("RAILWAY_AGENT_IMAGE"))
                .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string()),
            docker_data_dir,
            bucket,
            harness_url: lookup("AIRLIFT_HARNESS_URL")
                .unwrap_or_else(|| DEFAULT_HARNESS_URL.to_string()),
            api_key_secret: lookup("AIRLIFT_API_KEY_SECRET")
                .unwrap_or_else(|| "anthropic-api-key".to_string()),
            oauth_secret: lookup("AIRLIFT_OAUTH_SECRET")
                .unwrap_or_else(|| "claude-oauth-credentials".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Region derived from the zone (`us-central1-a` -> `us-central1`).
    pub fn gcp_region(&self) -> String {
        match self.gcp_zone.rsplit_once('-') {
            Some((region, _)) => region.to_string(),
            None => self.gcp_zone.clone(),
        }
    }

    /// Validate provider-specific requirements, naming the setting to fix.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        match self.provider {
            ProviderKind::Gcp => {
                if self.gcp_project.is_none() {
                    errors.push(
                        "GCP project not configured: set AIRLIFT_PROJECT or GOOGLE_CLOUD_PROJECT"
                            .to_string(),
                    );
                }
                if self.bucket.is_none() {
                    errors.push("state bucket not configured: set AIRLIFT_BUCKET".to_string());
                }
            }
            ProviderKind::Aws => {
                if self.bucket.is_none() {
                    errors.push("state bucket not configured: set AIRLIFT_BUCKET".to_string());
                }
            }
            ProviderKind::Railway => {
                if self.railway_token.is_none() {
                    errors.push("Railway token not configured: set RAILWAY_TOKEN".to_string());
                }
            }
            ProviderKind::Docker => {}
        }
        if !errors.is_empty() {
            bail!("configuration errors:\n- {}", errors.join("\n- "));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn gcp_defaults_with_derived_bucket() {
        let lookup = lookup_from(&[("AIRLIFT_PROJECT", "my-project")]);
        let config = Config::from_env_with(&lookup, None, None).expect("load");
        assert_eq!(config.provider, ProviderKind::Gcp);
        assert_eq!(config.auth_type, AuthType::ApiKey);
        assert_eq!(config.gcp_zone, "us-central1-a");
        assert_eq!(config.gcp_region(), "us-central1");
        assert_eq!(config.bucket.as_deref(), Some("airlift-my-project"));
    }

    #[test]
    fn missing_gcp_project_names_the_variable() {
        let lookup = lookup_from(&[]);
        let err = Config::from_env_with(&lookup, None, None).unwrap_err();
        assert!(err.to_string().contains("AIRLIFT_PROJECT"));
    }

    #[test]
    fn railway_requires_token() {
        let lookup = lookup_from(&[]);
        let err = Config::from_env_with(&lookup, Some("railway"), None).unwrap_err();
        assert!(err.to_string().contains("RAILWAY_TOKEN"));

        let lookup = lookup_from(&[("RAILWAY_TOKEN", "tok")]);
        let config = Config::from_env_with(&lookup, Some("railway"), None).expect("load");
        assert_eq!(config.provider, ProviderKind::Railway);
    }

    #[test]
    fn docker_needs_no_cloud_settings() {
        let lookup = lookup_from(&[("HOME", "/home/op")]);
        let config = Config::from_env_with(&lookup, Some("docker"), None).expect("load");
        assert_eq!(config.provider, ProviderKind::Docker);
        assert_eq!(config.docker_data_dir, PathBuf::from("/home/op/.airlift"));
    }

    #[test]
    fn overrides_beat_environment() {
        let lookup = lookup_from(&[
            ("AIRLIFT_PROVIDER", "gcp"),
            ("AIRLIFT_AUTH_TYPE", "api_key"),
            ("AIRLIFT_PROJECT", "p"),
        ]);
        let config =
            Config::from_env_with(&lookup, Some("docker"), Some("oauth")).expect("load");
        assert_eq!(config.provider, ProviderKind::Docker);
        assert_eq!(config.auth_type, AuthType::Oauth);
    }

    #[test]
    fn invalid_provider_is_a_config_error() {
        let lookup = lookup_from(&[]);
        let err = Config::from_env_with(&lookup, Some("azure"), None).unwrap_err();
        assert!(err.to_string().contains("azure"));
    }

    #[test]
    fn aws_requires_bucket() {
        let lookup = lookup_from(&[]);
        let err = Config::from_env_with(&lookup, Some("aws"), None).unwrap_err();
        assert!(err.to_string().contains("AIRLIFT_BUCKET"));

        let lookup = lookup_from(&[("AIRLIFT_BUCKET", "b"), ("AWS_REGION", "eu-west-1")]);
        let config = Config::from_env_with(&lookup, Some("aws"), None).expect("load");
        assert_eq!(config.aws_region, "eu-west-1");
    }
}
