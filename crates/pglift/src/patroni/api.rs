//! Client for the Patroni REST API.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::settings::RestApiSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A cluster member, as listed by `GET /cluster`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Member {
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ClusterInfo {
    #[serde(default)]
    members: Vec<Member>,
}

pub struct Api {
    base_url: String,
    client: Client,
}

impl Api {
    /// Client for the node reachable at `address` (`host:port`).
    pub fn new(address: &str, settings: &RestApiSettings) -> Result<Self> {
        let scheme = if settings.certfile.is_some() {
            "https"
        } else {
            "http"
        };
        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(cafile) = &settings.cafile {
            let pem = std::fs::read(cafile).map_err(|e| Error::io(cafile, e))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        Ok(Self {
            base_url: format!("{}://{}", scheme, address),
            client: builder.build()?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn check(&self, path: &str, status: StatusCode) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        Err(Error::Http(format!(
            "{} returned HTTP {}",
            self.url(path),
            status
        )))
    }

    /// Whether the node answers 200 on `/readiness`.
    pub fn readiness(&self) -> Result<bool> {
        let response = self.client.get(self.url("readiness")).send()?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Makes Patroni re-read its configuration file.
    pub fn reload(&self) -> Result<()> {
        log::info!("reloading Patroni configuration through {}", self.base_url);
        let response = self.client.post(self.url("reload")).send()?;
        self.check("reload", response.status())
    }

    /// Restarts PostgreSQL on this node.
    pub fn restart(&self) -> Result<()> {
        log::info!("restarting PostgreSQL through {}", self.base_url);
        let response = self.client.post(self.url("restart")).json(&serde_json::json!({})).send()?;
        self.check("restart", response.status())
    }

    pub fn cluster_members(&self) -> Result<Vec<Member>> {
        let response = self.client.get(self.url("cluster")).send()?;
        self.check("cluster", response.status())?;
        let info: ClusterInfo = response.json()?;
        Ok(info.members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_scheme_follows_certificate() {
        let api = Api::new("127.0.0.1:8008", &RestApiSettings::default()).unwrap();
        assert_eq!(api.base_url(), "http://127.0.0.1:8008");
        assert_eq!(api.url("/readiness"), "http://127.0.0.1:8008/readiness");

        let settings = RestApiSettings {
            certfile: Some(PathBuf::from("/etc/patroni/node.pem")),
            ..Default::default()
        };
        let api = Api::new("node1:8008", &settings).unwrap();
        assert_eq!(api.base_url(), "https://node1:8008");
    }

    #[test]
    fn test_cluster_members_parse() {
        let info: ClusterInfo = serde_json::from_str(
            r#"{"members": [{"name": "n1", "role": "leader", "state": "running",
                "host": "10.0.0.1", "port": 5432, "timeline": 1}],
                "scope": "main"}"#,
        )
        .unwrap();
        assert_eq!(info.members.len(), 1);
        assert_eq!(info.members[0].name, "n1");
        assert_eq!(info.members[0].port, Some(5432));
    }

    #[test]
    fn test_unreadable_cafile() {
        let settings = RestApiSettings {
            cafile: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        assert!(matches!(
            Api::new("127.0.0.1:8008", &settings),
            Err(Error::FileNotFound(_))
        ));
    }
}
