//! Rendezvous map loading.
//!
//! The map is a JSON document enumerating relay regions and their nodes,
//! in the public Tailscale DERP map format. Fetched maps are cached
//! in-process, keyed by source URL.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, RelayResult};

/// Map URL used when neither the config nor the environment supplies one.
pub const DEFAULT_DERP_MAP_URL: &str = "https://login.tailscale.com/derpmap/default";

/// Environment override for the default map URL.
pub const DERP_MAP_URL_ENV_VAR: &str = "RSSH_DERP_MAP_URL";

const FETCH_TIMEOUT: Duration = Duration::from_secs(8);

/// Response bodies beyond this are assumed to not be a rendezvous map.
const MAX_MAP_RESPONSE: usize = 2 << 20;

/// One relay node within a region.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DerpNode {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RegionID")]
    pub region_id: u16,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "CertName")]
    pub cert_name: String,
    #[serde(rename = "IPv4")]
    pub ipv4: String,
    #[serde(rename = "IPv6")]
    pub ipv6: String,
    /// STUN port; unused by the relay path, parsed for completeness.
    #[serde(rename = "STUNPort")]
    pub stun_port: i32,
    #[serde(rename = "DERPPort")]
    pub derp_port: u16,
    /// Plain-TCP node without TLS; only ever set by in-process test servers.
    #[serde(rename = "InsecureForTests")]
    pub insecure_for_tests: bool,
}

/// A relay region and its nodes.
#[derive(Debug, Clone, Default)]
pub struct DerpRegion {
    pub region_id: u16,
    pub region_code: String,
    pub region_name: String,
    pub nodes: Vec<DerpNode>,
}

/// The full relay map, regions keyed by id.
#[derive(Debug, Clone, Default)]
pub struct DerpMap {
    pub regions: BTreeMap<u16, DerpRegion>,
}

#[derive(Deserialize)]
struct RawMap {
    #[serde(rename = "Regions", default)]
    regions: HashMap<String, RawRegion>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawRegion {
    #[serde(rename = "RegionID")]
    region_id: u16,
    #[serde(rename = "RegionCode")]
    region_code: String,
    #[serde(rename = "RegionName")]
    region_name: String,
    #[serde(rename = "Nodes")]
    nodes: Vec<DerpNode>,
}

/// Parse a rendezvous map from its JSON representation.
pub fn parse_derp_map(data: &[u8]) -> RelayResult<DerpMap> {
    let raw: RawMap = serde_json::from_slice(data)
        .map_err(|e| RelayError::Rendezvous(format!("derp map parse failed: {}", e)))?;
    if raw.regions.is_empty() {
        return Err(RelayError::Rendezvous("derp map has no regions".into()));
    }

    let mut regions = BTreeMap::new();
    for (key, region) in raw.regions {
        let id = if region.region_id != 0 {
            region.region_id
        } else {
            key.parse::<u16>().map_err(|_| {
                RelayError::Rendezvous(format!("invalid region key {:?}", key))
            })?
        };
        regions.insert(
            id,
            DerpRegion {
                region_id: id,
                region_code: region.region_code,
                region_name: region.region_name,
                nodes: region.nodes,
            },
        );
    }

    Ok(DerpMap { regions })
}

/// Resolve the map URL: explicit config value, environment, then default.
pub fn effective_derp_map_url(explicit_url: &str) -> String {
    let explicit = explicit_url.trim();
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    if let Ok(env) = std::env::var(DERP_MAP_URL_ENV_VAR) {
        let env = env.trim();
        if !env.is_empty() {
            return env.to_string();
        }
    }
    DEFAULT_DERP_MAP_URL.to_string()
}

fn map_cache() -> &'static Mutex<HashMap<String, Arc<DerpMap>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<DerpMap>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch and parse the rendezvous map, consulting the in-process cache.
pub async fn fetch_derp_map(explicit_url: &str) -> RelayResult<Arc<DerpMap>> {
    let url = effective_derp_map_url(explicit_url);

    if let Some(cached) = map_cache().lock().expect("map cache poisoned").get(&url) {
        return Ok(cached.clone());
    }

    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| RelayError::Rendezvous(format!("derp map client: {}", e)))?;

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| RelayError::Rendezvous(format!("derp map fetch failed: {}", e)))?;
    if !response.status().is_success() {
        return Err(RelayError::Rendezvous(format!(
            "unexpected status {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| RelayError::Rendezvous(format!("derp map read failed: {}", e)))?;
    if body.len() > MAX_MAP_RESPONSE {
        return Err(RelayError::Rendezvous(format!(
            "derp map response too large: {} bytes",
            body.len()
        )));
    }

    let parsed = Arc::new(parse_derp_map(&body)?);
    map_cache()
        .lock()
        .expect("map cache poisoned")
        .insert(url, parsed.clone());
    Ok(parsed)
}
