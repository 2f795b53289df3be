//! X-Plane web API REST client
//!
//! Used to select the API version, to resolve dataref and command names
//! for the [`Registry`](crate::Registry), and for one-off reads, writes and
//! command activations that do not need a subscription.
//!
//! Endpoints, relative to `http://{host}:{port}/api`:
//!
//! | method | path | use |
//! |---|---|---|
//! | GET | `/capabilities` | advertised API versions (12.1.4 and later) |
//! | GET | `/v1/datarefs/count` | detects v1-only simulators |
//! | GET | `/{v}/datarefs?filter[name]=..` | dataref lookup |
//! | GET | `/{v}/commands?filter[name]=..` | command lookup (v2) |
//! | GET/PATCH | `/{v}/datarefs/{id}/value` | read or write a value |
//! | POST | `/{v}/command/{id}/activate` | run a command |

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ApiConfig;
use crate::registry::{CommandRecord, DatarefRecord, Directory};
use crate::types::{BeaconRecord, Value, ValueType};
use crate::{LinkError, Result};

/// Web API version, `v1`, `v2`, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion(pub u32);

impl ApiVersion {
    pub const V1: ApiVersion = ApiVersion(1);
    pub const V2: ApiVersion = ApiVersion(2);

    /// Latest API a simulator version is known to offer.
    pub fn for_simulator(version: u32) -> Option<ApiVersion> {
        match version {
            v if v >= 121400 => Some(ApiVersion::V2),
            v if v >= 121100 => Some(ApiVersion::V1),
            _ => None,
        }
    }

    /// Commands are only listed from v2 on.
    pub fn has_commands(&self) -> bool {
        *self >= ApiVersion::V2
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for ApiVersion {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim_start_matches('/')
            .strip_prefix('v')
            .and_then(|n| n.parse().ok())
            .map(ApiVersion)
            .ok_or_else(|| LinkError::decode("API version", format!("{:?} is not of the form vN", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiVersions {
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorInfo {
    pub version: String,
}

/// Response of `GET /api/capabilities`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub api: ApiVersions,
    #[serde(rename = "x-plane", default)]
    pub simulator: Option<SimulatorInfo>,
}

impl Capabilities {
    /// What a 12.1.1 to 12.1.3 simulator offers; it has no capabilities endpoint.
    pub fn v1_only() -> Self {
        Self {
            api: ApiVersions { versions: vec!["v1".to_string()] },
            simulator: Some(SimulatorInfo { version: "12.1.1".to_string() }),
        }
    }

    /// Advertised versions that parse, ascending.
    pub fn versions(&self) -> Vec<ApiVersion> {
        let mut versions: Vec<ApiVersion> = self.api.versions.iter().filter_map(|v| v.parse().ok()).collect();
        versions.sort();
        versions.dedup();
        versions
    }

    /// Pick `preferred` if advertised, the latest advertised version otherwise.
    pub fn select(&self, preferred: Option<&str>) -> Result<ApiVersion> {
        let versions = self.versions();
        if let Some(preferred) = preferred {
            let wanted: ApiVersion = preferred.parse()?;
            if versions.contains(&wanted) {
                return Ok(wanted);
            }
            warn!("API {} not offered (offered: {:?}), using latest", wanted, self.api.versions);
        }
        versions
            .last()
            .copied()
            .ok_or_else(|| LinkError::decode("capabilities", "no API version advertised"))
    }
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Serialize)]
struct ActivateBody {
    id: i64,
    duration: f64,
}

/// REST client bound to one simulator host and API version.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    /// `http://host:port`
    origin: String,
    root: String,
    version: ApiVersion,
}

impl RestClient {
    /// Client for an explicit host, port and API version.
    pub fn new(host: IpAddr, port: u16, version: ApiVersion, config: &ApiConfig) -> Result<Self> {
        let origin = match host {
            IpAddr::V4(ip) => format!("http://{}:{}", ip, port),
            IpAddr::V6(ip) => format!("http://[{}]:{}", ip, port),
        };
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .no_proxy()
            .build()
            .map_err(|e| LinkError::Http { url: origin.clone(), source: e })?;
        let root = format!("/{}", config.root.trim_matches('/'));
        Ok(Self { http, origin, root, version })
    }

    /// Client for the simulator behind `beacon`.
    ///
    /// Local simulators are reached on loopback and the local port, remote
    /// ones on the beacon address and the remote port. The API version is
    /// negotiated through the capabilities endpoint.
    pub async fn for_beacon(beacon: &BeaconRecord, local: &[IpAddr], config: &ApiConfig) -> Result<Self> {
        let same_host = beacon.is_local(local);
        let host = beacon.api_host(local);
        let port = if same_host { config.local_port } else { config.remote_port };
        let fallback = ApiVersion::for_simulator(beacon.version).unwrap_or(ApiVersion::V1);

        let mut client = Self::new(host, port, fallback, config)?;
        match client.capabilities().await {
            Ok(capabilities) => {
                client.version = capabilities.select(config.preferred_version.as_deref())?;
                info!(
                    simulator = ?capabilities.simulator.as_ref().map(|s| s.version.as_str()),
                    "Selected API {} ({:?})",
                    client.version,
                    capabilities.api.versions
                );
            }
            Err(e) => {
                warn!("Capabilities unavailable, using API {} from beacon version {}: {}", fallback, beacon.version, e);
            }
        }
        info!(same_host, "X-Plane API at {}", client.api_url());
        Ok(client)
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    /// `http://host:port/api/vN`
    pub fn api_url(&self) -> String {
        format!("{}{}/{}", self.origin, self.root, self.version)
    }

    /// `ws://host:port/api/vN`
    pub fn websocket_url(&self) -> String {
        self.api_url().replacen("http:", "ws:", 1)
    }

    /// Advertised capabilities, probing `/v1` on simulators that predate the endpoint.
    pub async fn capabilities(&self) -> Result<Capabilities> {
        let url = format!("{}{}/capabilities", self.origin, self.root);
        match self.get_json::<Capabilities>(&url, &[]).await {
            Ok(capabilities) => {
                debug!(?capabilities, "Capabilities received");
                Ok(capabilities)
            }
            Err(LinkError::HttpStatus { status, .. }) => {
                debug!(status, "No capabilities endpoint, probing v1");
                self.dataref_count_at(ApiVersion::V1).await?;
                Ok(Capabilities::v1_only())
            }
            Err(e) => Err(e),
        }
    }

    /// Number of datarefs the simulator exposes.
    pub async fn dataref_count(&self) -> Result<u64> {
        self.dataref_count_at(self.version).await
    }

    async fn dataref_count_at(&self, version: ApiVersion) -> Result<u64> {
        let url = format!("{}{}/{}/datarefs/count", self.origin, self.root, version);
        let envelope: DataEnvelope<u64> = self.get_json(&url, &[]).await?;
        Ok(envelope.data)
    }

    /// Read a dataref value once.
    pub async fn read_value(&self, id: i64, value_type: ValueType) -> Result<Value> {
        let url = format!("{}/datarefs/{}/value", self.api_url(), id);
        let envelope: DataEnvelope<serde_json::Value> = self.get_json(&url, &[]).await?;
        Value::from_json(value_type, &envelope.data)
    }

    /// Write a dataref value, or one array element when `index` is given.
    pub async fn write_value(&self, id: i64, value: &Value, index: Option<u32>) -> Result<()> {
        let url = format!("{}/datarefs/{}/value", self.api_url(), id);
        let mut request = self.http.patch(&url).json(&serde_json::json!({ "data": value.to_json() }));
        if let Some(index) = index {
            request = request.query(&[("index", index)]);
        }
        let response = request.send().await.map_err(|e| LinkError::Http { url: url.clone(), source: e })?;
        check_status(&url, response.status())?;
        debug!(id, ?index, "Dataref written");
        Ok(())
    }

    /// Run a command for `duration` seconds; zero is a single press.
    pub async fn activate_command(&self, id: i64, duration: f64) -> Result<()> {
        let url = format!("{}/command/{}/activate", self.api_url(), id);
        let response = self
            .http
            .post(&url)
            .json(&ActivateBody { id, duration })
            .send()
            .await
            .map_err(|e| LinkError::Http { url: url.clone(), source: e })?;
        check_status(&url, response.status())?;
        debug!(id, duration, "Command activated");
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| LinkError::Http { url: url.to_string(), source: e })?;
        check_status(url, response.status())?;
        let bytes = response.bytes().await.map_err(|e| LinkError::Http { url: url.to_string(), source: e })?;
        serde_json::from_slice(&bytes).map_err(|e| LinkError::decode(url.to_string(), e.to_string()))
    }

    /// Filter-by-name lookup; 404 means no match.
    async fn lookup<T: DeserializeOwned + HasName>(&self, collection: &str, name: &str) -> Result<Option<T>> {
        let url = format!("{}/{}", self.api_url(), collection);
        match self.get_json::<DataEnvelope<Vec<T>>>(&url, &[("filter[name]", name)]).await {
            Ok(envelope) => Ok(envelope.data.into_iter().find(|record| record.name() == name)),
            Err(LinkError::HttpStatus { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn check_status(url: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(LinkError::HttpStatus { url: url.to_string(), status: status.as_u16() })
    }
}

trait HasName {
    fn name(&self) -> &str;
}

impl HasName for DatarefRecord {
    fn name(&self) -> &str {
        &self.name
    }
}

impl HasName for CommandRecord {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait::async_trait]
impl Directory for RestClient {
    async fn lookup_dataref(&self, name: &str) -> Result<Option<DatarefRecord>> {
        self.lookup("datarefs", name).await
    }

    async fn lookup_command(&self, name: &str) -> Result<Option<CommandRecord>> {
        if !self.version.has_commands() {
            debug!("Command lookup needs API v2, {} selected", self.version);
            return Ok(None);
        }
        self.lookup("commands", name).await
    }
}
