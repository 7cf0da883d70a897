//! Rendezvous node selection.
//!
//! The server picks a node deterministically: the preferred region (when
//! present in the map) first, remaining regions in ascending id order, first
//! usable node per region. Dialing clients instead rank one candidate per
//! region by measured TCP connect latency and take the fastest.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};

use crate::derp::map::{DerpMap, DerpNode};
use crate::error::{RelayError, RelayResult};

const PROBE_TIMEOUT: Duration = Duration::from_millis(750);
const MAX_CONCURRENT_PROBES: usize = 8;

/// Sentinel latency for candidates that failed the probe; sorts last but is
/// never discarded.
const UNREACHABLE_LATENCY: Duration = Duration::from_secs(3600);

/// A node may be selected once it has a hostname; a zero relay port means
/// the default 443.
fn normalize_node(node: &DerpNode) -> Option<DerpNode> {
    if node.host_name.trim().is_empty() {
        return None;
    }
    let mut node = node.clone();
    if node.derp_port == 0 {
        node.derp_port = 443;
    }
    Some(node)
}

/// Deterministic server-side pick honouring the preferred region.
pub(crate) fn pick_derp_node(
    map: &DerpMap,
    preferred_region: u16,
) -> RelayResult<(u16, DerpNode)> {
    if map.regions.is_empty() {
        return Err(RelayError::Rendezvous("derp map has no regions".into()));
    }

    let mut try_regions = Vec::with_capacity(map.regions.len());
    if preferred_region != 0 && map.regions.contains_key(&preferred_region) {
        try_regions.push(preferred_region);
    }
    try_regions.extend(
        map.regions
            .keys()
            .copied()
            .filter(|id| preferred_region == 0 || *id != preferred_region),
    );

    for region_id in try_regions {
        let Some(region) = map.regions.get(&region_id) else {
            continue;
        };
        if let Some(node) = region.nodes.iter().find_map(normalize_node) {
            return Ok((region_id, node));
        }
    }

    Err(RelayError::Rendezvous(
        "derp map contains no usable node".into(),
    ))
}

/// One candidate per region, ascending region id; within a region the
/// usable nodes are ordered by (hostname, port, name) before taking the
/// first.
pub(crate) fn ordered_region_candidates(map: &DerpMap) -> Vec<(u16, DerpNode)> {
    let mut candidates = Vec::new();
    for (region_id, region) in &map.regions {
        let mut usable: Vec<DerpNode> = region.nodes.iter().filter_map(normalize_node).collect();
        usable.sort_by(|a, b| {
            (&a.host_name, a.derp_port, &a.name).cmp(&(&b.host_name, b.derp_port, &b.name))
        });
        if let Some(node) = usable.into_iter().next() {
            candidates.push((*region_id, node));
        }
    }
    candidates
}

/// Order probed candidates by ascending latency, region id as tiebreak.
pub(crate) fn rank_by_latency(
    mut probed: Vec<(u16, DerpNode, Duration)>,
) -> Vec<(u16, DerpNode, Duration)> {
    probed.sort_by_key(|(region_id, _, latency)| (*latency, *region_id));
    probed
}

/// Latency-ranked pick used by the dial path.
pub(crate) async fn pick_nearest_derp_node(map: &DerpMap) -> RelayResult<(u16, DerpNode)> {
    if map.regions.is_empty() {
        return Err(RelayError::Rendezvous("derp map has no regions".into()));
    }

    let candidates = ordered_region_candidates(map);
    if candidates.is_empty() {
        return Err(RelayError::Rendezvous(
            "derp map contains no usable node".into(),
        ));
    }

    let mut latencies = vec![UNREACHABLE_LATENCY; candidates.len()];
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
    let mut probes = JoinSet::new();

    for (index, (_, node)) in candidates.iter().enumerate() {
        let address = format!("{}:{}", node.host_name, node.derp_port);
        let semaphore = semaphore.clone();
        probes.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (index, probe_node_latency(&address).await)
        });
    }

    while let Some(result) = probes.join_next().await {
        if let Ok((index, latency)) = result {
            latencies[index] = latency;
        }
    }

    let probed = candidates
        .into_iter()
        .zip(latencies)
        .map(|((region_id, node), latency)| (region_id, node, latency))
        .collect();

    match rank_by_latency(probed).into_iter().next() {
        Some((region_id, node, _)) => Ok((region_id, node)),
        None => Err(RelayError::Rendezvous(
            "derp map contains no usable node".into(),
        )),
    }
}

/// TCP connect latency to `address`, or the unreachable sentinel.
async fn probe_node_latency(address: &str) -> Duration {
    let start = Instant::now();
    match timeout(PROBE_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(_)) => start.elapsed(),
        _ => UNREACHABLE_LATENCY,
    }
}
