//! GitHub repository access checks.

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::git::parse_repo;

/// Outcome of an access check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheck {
    pub has_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
    permissions: Option<serde_json::Value>,
}

/// Checks repository access with the server's configured token.
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: reqwest::Client,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("open-commander/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("building GitHub client")?;

        Ok(Self { client, token })
    }

    /// Query the repository with the configured token. Failures are
    /// reported in-band: the check surface never errors on "no access".
    pub async fn verify_access(&self, repository: &str) -> AccessCheck {
        let (owner, name) = match parse_repo(repository) {
            Ok(parsed) => parsed,
            Err(err) => {
                return AccessCheck {
                    has_access: false,
                    repository: None,
                    permissions: None,
                    error: Some(err.to_string()),
                };
            }
        };

        let url = format!("https://api.github.com/repos/{owner}/{name}");
        let mut request = self.client.get(&url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<RepoResponse>().await {
                    Ok(repo) => AccessCheck {
                        has_access: true,
                        repository: Some(repo.full_name),
                        permissions: repo.permissions,
                        error: None,
                    },
                    Err(err) => AccessCheck {
                        has_access: false,
                        repository: None,
                        permissions: None,
                        error: Some(format!("unexpected response shape: {err}")),
                    },
                }
            }
            Ok(response) => {
                debug!("access check for {} returned {}", repository, response.status());
                AccessCheck {
                    has_access: false,
                    repository: None,
                    permissions: None,
                    error: Some(format!("GitHub returned {}", response.status())),
                }
            }
            Err(err) => AccessCheck {
                has_access: false,
                repository: None,
                permissions: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_repository_is_reported_in_band() {
        let client = GithubClient::new(None).unwrap();
        let check = client.verify_access("not-a-repo").await;
        assert!(!check.has_access);
        assert!(check.error.is_some());
    }
}
