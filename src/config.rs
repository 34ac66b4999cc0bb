//! Operator configuration, read from the environment at startup.
//!
//! Credentials may be passed either inline or as file paths (recommended for
//! mounted secrets); file contents are trimmed of surrounding whitespace.

use std::env;

use color_eyre::eyre::{bail, eyre, Result};

const DEFAULT_CLIENT_IMAGE: &str = "ghcr.io/tunnel-operator/tunnel-client:0.9.3";
const DEFAULT_SERVER_VERSION: &str = "0.9.3";
const DEFAULT_MAX_CLIENT_MEMORY: &str = "128Mi";

/// Infrastructure configuration for provisioning exit nodes.
#[derive(Debug, Clone, Default)]
pub struct InfraConfig {
    pub provider: String,
    pub region: String,
    pub zone: String,
    pub access_key: String,
    pub access_key_file: String,
    pub secret_key: String,
    pub secret_key_file: String,
    pub organization_id: String,
    pub subscription_id: String,
    pub project_id: String,
    pub vpc_id: String,
    pub subnet_id: String,
    /// Overrides the provider's default instance plan when non-empty.
    pub plan: String,
    /// When true, only services carrying the manage annotation get tunnels.
    pub annotated_only: bool,
    pub client_image: String,
    pub max_client_memory: String,
    pub server_version: String,
    pub license: String,
    pub license_file: String,
}

fn env_or_default(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

impl InfraConfig {
    pub fn from_env() -> Result<Self> {
        let config = InfraConfig {
            provider: env::var("PROVIDER")
                .map_err(|_| eyre!("PROVIDER is required, e.g. digitalocean"))?,
            region: env_or_default("REGION"),
            zone: env_or_default("ZONE"),
            access_key: env_or_default("ACCESS_KEY"),
            access_key_file: env_or_default("ACCESS_KEY_FILE"),
            secret_key: env_or_default("SECRET_KEY"),
            secret_key_file: env_or_default("SECRET_KEY_FILE"),
            organization_id: env_or_default("ORGANIZATION_ID"),
            subscription_id: env_or_default("SUBSCRIPTION_ID"),
            project_id: env_or_default("PROJECT_ID"),
            vpc_id: env_or_default("VPC_ID"),
            subnet_id: env_or_default("SUBNET_ID"),
            plan: env_or_default("PLAN"),
            annotated_only: env::var("ANNOTATED_ONLY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            client_image: env_or_default("CLIENT_IMAGE"),
            max_client_memory: env_or_default("MAX_CLIENT_MEMORY"),
            server_version: env_or_default("SERVER_VERSION"),
            license: env_or_default("LICENSE"),
            license_file: env_or_default("LICENSE_FILE"),
        };

        config.validate()?;
        Ok(config)
    }

    /// Provider-specific required fields, checked before any provisioner is
    /// constructed.
    pub fn validate(&self) -> Result<()> {
        match self.provider.as_str() {
            "equinix-metal" => {
                if self.project_id.is_empty() {
                    bail!("project-id required for provider: {}", self.provider);
                }
            }
            "gce" => {
                if self.project_id.is_empty() {
                    bail!("project-id required for provider: {}", self.provider);
                }
                if self.zone.is_empty() {
                    bail!("zone required for provider: {}", self.provider);
                }
            }
            "azure" => {
                if self.subscription_id.is_empty() {
                    bail!("subscription-id required for provider: {}", self.provider);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Access key, read from file when a path is configured.
    pub fn get_access_key(&self) -> Result<String> {
        read_key(&self.access_key, &self.access_key_file)
    }

    /// Secret key, read from file when a path is configured.
    pub fn get_secret_key(&self) -> Result<String> {
        read_key(&self.secret_key, &self.secret_key_file)
    }

    pub fn get_client_image(&self) -> String {
        if self.client_image.is_empty() {
            return DEFAULT_CLIENT_IMAGE.to_string();
        }
        self.client_image.clone()
    }

    pub fn get_server_version(&self) -> String {
        if self.server_version.is_empty() {
            return DEFAULT_SERVER_VERSION.to_string();
        }
        self.server_version.clone()
    }

    pub fn get_max_client_memory(&self) -> String {
        if self.max_client_memory.is_empty() {
            return DEFAULT_MAX_CLIENT_MEMORY.to_string();
        }
        self.max_client_memory.clone()
    }

    /// License key from the literal value or file. Accepts JWT-style keys
    /// (two or more dots) and UUID-style keys (three dashes).
    pub fn get_license_key(&self) -> Result<String> {
        let val = if !self.license.is_empty() {
            self.license.clone()
        } else {
            std::fs::read_to_string(&self.license_file)
                .map_err(|e| eyre!("error reading license file: {e}"))?
        };

        if val.is_empty() {
            bail!("a license is required for the tunnel server");
        }

        let trimmed = val.trim();
        if trimmed.matches('.').count() >= 2 || trimmed.matches('-').count() == 3 {
            return Ok(trimmed.to_string());
        }

        bail!("license key may be invalid")
    }
}

fn read_key(literal: &str, file: &str) -> Result<String> {
    if !file.is_empty() {
        let data = std::fs::read_to_string(file)?;
        return Ok(data.trim().to_string());
    }
    Ok(literal.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn validate_passes_for_digitalocean() {
        let config = InfraConfig {
            provider: "digitalocean".into(),
            region: "lon1".into(),
            access_key: "set".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_project_id_for_gce() {
        let config = InfraConfig {
            provider: "gce".into(),
            zone: "us-central1-a".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "project-id required for provider: gce");
    }

    #[test]
    fn validate_requires_zone_for_gce() {
        let config = InfraConfig {
            provider: "gce".into(),
            project_id: "my-project".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "zone required for provider: gce");
    }

    #[test]
    fn validate_requires_project_id_for_equinix_metal() {
        let config = InfraConfig {
            provider: "equinix-metal".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "project-id required for provider: equinix-metal"
        );
    }

    #[test]
    fn validate_requires_subscription_id_for_azure() {
        let config = InfraConfig {
            provider: "azure".into(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "subscription-id required for provider: azure"
        );
    }

    #[test]
    fn license_key_from_literal() {
        let config = InfraConfig {
            license: "static.key.text".into(),
            ..Default::default()
        };
        assert_eq!(config.get_license_key().unwrap(), "static.key.text");
    }

    #[test]
    fn license_key_from_file_trims_whitespace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "\nstatic.key.text\n").unwrap();

        let config = InfraConfig {
            license_file: file.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert_eq!(config.get_license_key().unwrap(), "static.key.text");
    }

    #[test]
    fn license_key_rejects_garbage() {
        let config = InfraConfig {
            license: "not a key".into(),
            ..Default::default()
        };
        assert!(config.get_license_key().is_err());
    }

    #[test]
    fn access_key_file_trims_whitespace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "s3cret\n").unwrap();

        let config = InfraConfig {
            access_key: "inline".into(),
            access_key_file: file.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert_eq!(config.get_access_key().unwrap(), "s3cret");
    }
}
