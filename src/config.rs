use crate::error::{PanelError, PanelResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_TENANT_API_VERSION: &str = "2024-05-01-preview";

/// Which flavour of the provider API a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Key goes straight to the public API.
    #[default]
    Direct,
    /// Key plus endpoint and API version of a tenant deployment.
    Tenant,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Direct => f.write_str("direct"),
            Backend::Tenant => f.write_str("tenant"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" | "openai" => Ok(Backend::Direct),
            "tenant" | "azure" => Ok(Backend::Tenant),
            other => Err(format!("unknown backend '{}', expected direct or tenant", other)),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Direct {
        api_key: String,
        base_url: String,
    },
    Tenant {
        api_key: String,
        endpoint: String,
        api_version: String,
    },
}

// Keys stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Direct { base_url, .. } => f
                .debug_struct("Direct")
                .field("base_url", base_url)
                .finish_non_exhaustive(),
            Credentials::Tenant {
                endpoint,
                api_version,
                ..
            } => f
                .debug_struct("Tenant")
                .field("endpoint", endpoint)
                .field("api_version", api_version)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    pub fn from_env(backend: Backend) -> PanelResult<Self> {
        Self::from_lookup(backend, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(backend: Backend, lookup: F) -> PanelResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> PanelResult<String> {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| PanelError::AuthFailure(format!("{} is not set", name)))
        };

        match backend {
            Backend::Direct => {
                let api_key = required("OPENAI_API_KEY")?;
                let base_url = lookup("OPENAI_BASE_URL")
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
                Ok(Credentials::Direct {
                    api_key,
                    base_url: checked_url("OPENAI_BASE_URL", &base_url)?,
                })
            }
            Backend::Tenant => {
                let api_key = required("AZURE_OPENAI_API_KEY")?;
                let endpoint = required("AZURE_OPENAI_ENDPOINT")?;
                let api_version = lookup("AZURE_OPENAI_API_VERSION")
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| DEFAULT_TENANT_API_VERSION.to_string());
                Ok(Credentials::Tenant {
                    api_key,
                    endpoint: checked_url("AZURE_OPENAI_ENDPOINT", &endpoint)?,
                    api_version,
                })
            }
        }
    }

    pub fn backend(&self) -> Backend {
        match self {
            Credentials::Direct { .. } => Backend::Direct,
            Credentials::Tenant { .. } => Backend::Tenant,
        }
    }
}

fn checked_url(name: &str, value: &str) -> PanelResult<String> {
    let trimmed = value.trim_end_matches('/');
    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(trimmed.to_string()),
        _ => Err(PanelError::AuthFailure(format!(
            "{} is not a valid http(s) URL: {}",
            name, value
        ))),
    }
}
