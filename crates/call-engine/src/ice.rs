//! ICE server provisioning: static lists, fetched relay credentials,
//! staleness-based refresh, and the STUN-only fallback.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CallError, CallResult};

/// One STUN or TURN endpoint group, in the shape RTC configuration
/// expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls.iter().any(|url| url.starts_with("turn"))
    }
}

/// Source of relay endpoints, typically time-limited TURN credentials.
#[async_trait::async_trait]
pub trait IceConfigSource: Send + Sync {
    async fn fetch(&self) -> CallResult<Vec<IceServer>>;
}

#[derive(Deserialize)]
struct IceServerResponse {
    #[serde(rename = "iceServers")]
    ice_servers: Vec<IceServer>,
}

/// Fetches `{"iceServers": [...]}` from a credential endpoint.
pub struct HttpTurnSource {
    client: reqwest::Client,
    url: String,
}

impl HttpTurnSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl IceConfigSource for HttpTurnSource {
    async fn fetch(&self) -> CallResult<Vec<IceServer>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| CallError::Setup(format!("credential fetch: {err}")))?;
        if !response.status().is_success() {
            return Err(CallError::Setup(format!(
                "credential endpoint returned {}",
                response.status()
            )));
        }
        let body = response
            .json::<IceServerResponse>()
            .await
            .map_err(|err| CallError::Setup(format!("credential body: {err}")))?;
        Ok(body.ice_servers)
    }
}

/// What the next negotiation should dial with. `degraded` carries a
/// reason when the credential source failed and only the static
/// fallback list is in use.
#[derive(Debug, Clone)]
pub struct IceSelection {
    pub servers: Vec<IceServer>,
    pub degraded: Option<String>,
}

struct CachedServers {
    servers: Vec<IceServer>,
    fetched_at: Instant,
}

/// Caches fetched servers and refreshes them once they outlive
/// `max_age`. Without a source it always hands out the fallback list.
pub struct IceProvider {
    source: Option<Arc<dyn IceConfigSource>>,
    fallback: Vec<IceServer>,
    max_age: Duration,
    cached: Mutex<Option<CachedServers>>,
}

impl IceProvider {
    pub fn new(fallback: Vec<IceServer>, max_age: Duration) -> Self {
        Self {
            source: None,
            fallback,
            max_age,
            cached: Mutex::new(None),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn IceConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Servers for the next negotiation. Stale credentials are
    /// refreshed first; a failed fetch degrades to the fallback list
    /// rather than blocking the call.
    pub async fn select(&self) -> IceSelection {
        let Some(source) = &self.source else {
            return IceSelection {
                servers: self.fallback.clone(),
                degraded: None,
            };
        };

        let mut cached = self.cached.lock().await;
        if let Some(entry) = cached.as_ref() {
            if entry.fetched_at.elapsed() < self.max_age {
                return IceSelection {
                    servers: entry.servers.clone(),
                    degraded: None,
                };
            }
            debug!("relay credentials stale, refreshing");
        }
        match source.fetch().await {
            Ok(servers) => {
                *cached = Some(CachedServers {
                    servers: servers.clone(),
                    fetched_at: Instant::now(),
                });
                IceSelection {
                    servers,
                    degraded: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "relay credential fetch failed, using fallback servers");
                *cached = None;
                IceSelection {
                    servers: self.fallback.clone(),
                    degraded: Some(err.to_string()),
                }
            }
        }
    }
}
