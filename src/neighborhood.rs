//! Neighborhood derivation.
//!
//! The static neighbor set of an agent comes either from a JSON topology
//! file or from a deterministic pairwise hash, and is symmetric by
//! construction. An optional time-varying filter simulates link flaps when
//! connections are not configured as stable.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::NeighborhoodConfig;
use crate::error::{ConcordError, ErrorCode, Result};
use crate::rap::{AgentId, Rap};

/// Width of one connectivity window in seconds.
const CONNECTIVITY_WINDOW_SECS: u64 = 10;

/// Derives and filters the neighbor set of one agent.
pub struct NeighborhoodDetector {
    base: AgentId,
    rap: Arc<Rap>,
    stable_connections: bool,
    neighborhood: Vec<AgentId>,
}

impl NeighborhoodDetector {
    /// Build from configuration: topology file or hash admission.
    pub fn from_config(rap: Arc<Rap>, base: AgentId, config: &NeighborhoodConfig) -> Result<Self> {
        if config.load_topology {
            Self::from_topology_file(
                rap,
                base,
                &config.topology_file,
                config.stable_connections,
            )
        } else {
            Ok(Self::from_hash(
                rap,
                base,
                config.neighbor_probability,
                config.stable_connections,
            ))
        }
    }

    /// Hash-derived neighborhood: a pair is adjacent when the last two
    /// decimal digits of `SHA-256("1" || sorted(a, b))` fall below the
    /// admission threshold.
    pub fn from_hash(
        rap: Arc<Rap>,
        base: AgentId,
        neighbor_probability: u8,
        stable_connections: bool,
    ) -> Self {
        let base_name = rap.agent_name(base).to_string();
        let neighborhood = rap
            .agents()
            .filter(|a| *a != base)
            .filter(|a| pair_is_adjacent(&base_name, rap.agent_name(*a), neighbor_probability))
            .collect();
        Self {
            base,
            rap,
            stable_connections,
            neighborhood,
        }
    }

    /// Neighborhood loaded from a `{agent: [neighbor, ...]}` adjacency map.
    pub fn from_topology_file(
        rap: Arc<Rap>,
        base: AgentId,
        path: impl AsRef<Path>,
        stable_connections: bool,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConcordError::with_internal(
                ErrorCode::TopologyError,
                format!("Cannot read topology file {}", path.as_ref().display()),
                e.to_string(),
            )
        })?;
        let adjacency: BTreeMap<String, Vec<String>> =
            serde_json::from_str(&text).map_err(|e| {
                ConcordError::with_internal(
                    ErrorCode::TopologyError,
                    "Topology file is not an adjacency map",
                    e.to_string(),
                )
            })?;

        let mut ids: BTreeMap<String, Vec<AgentId>> = BTreeMap::new();
        for (agent, neighbors) in &adjacency {
            if rap.agent_id(agent).is_none() {
                return Err(ConcordError::with_internal(
                    ErrorCode::TopologyError,
                    "Topology references an unknown agent",
                    agent.clone(),
                ));
            }
            let mut row = Vec::with_capacity(neighbors.len());
            for neighbor in neighbors {
                let id = rap.agent_id(neighbor).ok_or_else(|| {
                    ConcordError::with_internal(
                        ErrorCode::TopologyError,
                        "Topology references an unknown agent",
                        neighbor.clone(),
                    )
                })?;
                row.push(id);
            }
            ids.insert(agent.clone(), row);
        }

        // adjacency must be symmetric
        for (agent, neighbors) in &adjacency {
            for neighbor in neighbors {
                let reverse = adjacency
                    .get(neighbor)
                    .map(|back| back.contains(agent))
                    .unwrap_or(false);
                if !reverse {
                    return Err(ConcordError::with_internal(
                        ErrorCode::TopologyError,
                        "Topology file is not symmetric",
                        format!("{agent} -> {neighbor}"),
                    ));
                }
            }
        }

        let base_name = rap.agent_name(base).to_string();
        let mut neighborhood = ids.remove(&base_name).unwrap_or_default();
        neighborhood.sort_unstable();
        neighborhood.dedup();
        neighborhood.retain(|a| *a != base);

        Ok(Self {
            base,
            rap,
            stable_connections,
            neighborhood,
        })
    }

    /// The static neighbor set, ascending.
    pub fn neighborhood(&self) -> &[AgentId] {
        &self.neighborhood
    }

    /// The neighbors connected right now. With stable connections this is
    /// the static set; otherwise each link flaps pseudo-randomly per
    /// 10-second window with ~0.75 availability.
    pub fn current_neighborhood(&self) -> Vec<AgentId> {
        if self.stable_connections {
            return self.neighborhood.clone();
        }
        let window = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            / CONNECTIVITY_WINDOW_SECS;
        let base_name = self.rap.agent_name(self.base);
        self.neighborhood
            .iter()
            .copied()
            .filter(|a| pair_is_connected(base_name, self.rap.agent_name(*a), window))
            .collect()
    }
}

/// Canonical digest input for an unordered agent pair.
fn pair_digest(prefix: &str, a: &str, b: &str, suffix: &str) -> [u8; 32] {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(first.as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_bytes());
    hasher.update(suffix.as_bytes());
    hasher.finalize().into()
}

/// Last two decimal digits of the digest, compared to the threshold.
fn pair_is_adjacent(a: &str, b: &str, neighbor_probability: u8) -> bool {
    let digest = pair_digest("1", a, b, "");
    let mut modulus: u32 = 0;
    for byte in digest {
        modulus = (modulus * 256 + byte as u32) % 100;
    }
    modulus < neighbor_probability as u32
}

/// Last two binary digits of the windowed digest; zero means the link is
/// down for this window (~0.25 of windows).
fn pair_is_connected(a: &str, b: &str, window: u64) -> bool {
    let digest = pair_digest("", a, b, &window.to_string());
    digest[31] & 0b11 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rap::tests::toy_rap;
    use std::io::Write;

    #[test]
    fn test_hash_neighborhood_is_symmetric() {
        let rap = Arc::new(toy_rap(&["a", "b", "c", "d", "e"]));
        for a in rap.agents() {
            let det_a =
                NeighborhoodDetector::from_hash(rap.clone(), a, 50, true);
            for b in det_a.neighborhood() {
                let det_b = NeighborhoodDetector::from_hash(rap.clone(), *b, 50, true);
                assert!(
                    det_b.neighborhood().contains(&a),
                    "{} -> {} must be mutual",
                    rap.agent_name(a),
                    rap.agent_name(*b)
                );
            }
        }
    }

    #[test]
    fn test_probability_extremes() {
        let rap = Arc::new(toy_rap(&["a", "b", "c"]));
        let all = NeighborhoodDetector::from_hash(rap.clone(), AgentId(0), 100, true);
        assert_eq!(all.neighborhood().len(), 2);
        let none = NeighborhoodDetector::from_hash(rap.clone(), AgentId(0), 0, true);
        assert!(none.neighborhood().is_empty());
    }

    #[test]
    fn test_stable_current_equals_static() {
        let rap = Arc::new(toy_rap(&["a", "b", "c"]));
        let det = NeighborhoodDetector::from_hash(rap, AgentId(0), 100, true);
        assert_eq!(det.current_neighborhood(), det.neighborhood().to_vec());
    }

    #[test]
    fn test_connectivity_is_window_deterministic() {
        assert_eq!(
            pair_is_connected("a", "b", 42),
            pair_is_connected("b", "a", 42)
        );
    }

    #[test]
    fn test_topology_file_round_trip() {
        let rap = Arc::new(toy_rap(&["a", "b", "c"]));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"a": ["b"], "b": ["a", "c"], "c": ["b"]}}"#
        )
        .unwrap();

        let det = NeighborhoodDetector::from_topology_file(
            rap.clone(),
            rap.agent_id("b").unwrap(),
            file.path(),
            true,
        )
        .unwrap();
        assert_eq!(
            det.neighborhood(),
            &[rap.agent_id("a").unwrap(), rap.agent_id("c").unwrap()]
        );
    }

    #[test]
    fn test_asymmetric_topology_rejected() {
        let rap = Arc::new(toy_rap(&["a", "b"]));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"a": ["b"], "b": []}}"#).unwrap();

        let result = NeighborhoodDetector::from_topology_file(
            rap.clone(),
            rap.agent_id("a").unwrap(),
            file.path(),
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_agent_in_topology_rejected() {
        let rap = Arc::new(toy_rap(&["a", "b"]));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"a": ["ghost"], "ghost": ["a"]}}"#).unwrap();

        let result = NeighborhoodDetector::from_topology_file(
            rap.clone(),
            rap.agent_id("a").unwrap(),
            file.path(),
            true,
        );
        assert!(result.is_err());
    }
}
