//! Agency configuration (identity, endpoints, timing).

use crate::types::PeerId;
use std::time::Duration;

/// Static configuration for one agent.
///
/// The cluster size is the length of the endpoint table; peer ids index into
/// it. Endpoints can later be refreshed through vote-body gossip, but the
/// size of the cluster is fixed for the life of the agent.
#[derive(Debug, Clone)]
pub struct AgencyConfig {
    /// This peer's id, in `[0, endpoints.len())`.
    pub id: PeerId,

    /// Peer addresses, indexed by peer id.
    pub endpoints: Vec<String>,

    /// Minimum election timeout. A follower that hears nothing from a
    /// leader for a randomized duration in `[min, max]` starts an election.
    pub election_timeout_min: Duration,

    /// Maximum election timeout.
    pub election_timeout_max: Duration,

    /// Replication tick. The leader contacts every follower at least this
    /// often; an empty batch is a heartbeat. Must stay well below
    /// `election_timeout_min` to prevent spurious elections.
    pub heartbeat_interval: Duration,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            id: PeerId(0),
            endpoints: vec!["local://0".to_string()],
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(250),
        }
    }
}

impl AgencyConfig {
    /// Number of peers in the cluster.
    pub fn cluster_size(&self) -> usize {
        self.endpoints.len()
    }

    /// Smallest strict majority: `size/2 + 1`.
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Every peer id except our own.
    pub fn others(&self) -> impl Iterator<Item = PeerId> + '_ {
        let me = self.id;
        (0..self.cluster_size() as u64)
            .map(PeerId)
            .filter(move |p| *p != me)
    }

    /// Validate invariants between the fields.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoints.is_empty() {
            return Err("endpoint table is empty".to_string());
        }
        if self.id.as_usize() >= self.cluster_size() {
            return Err(format!(
                "peer id {} out of range for cluster of {}",
                self.id,
                self.cluster_size()
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be <= election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }
        Ok(())
    }

    /// A randomized election timeout in `[min, max]`.
    ///
    /// Each draw differs so competing candidates rarely collide.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_peer_config() -> AgencyConfig {
        AgencyConfig {
            id: PeerId(1),
            endpoints: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_valid() {
        assert!(AgencyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_quorum() {
        let mut config = three_peer_config();
        assert_eq!(config.quorum(), 2);
        config.endpoints.push("d".into());
        config.endpoints.push("e".into());
        assert_eq!(config.quorum(), 3);

        let single = AgencyConfig::default();
        assert_eq!(single.quorum(), 1);
    }

    #[test]
    fn test_others_excludes_self() {
        let config = three_peer_config();
        let others: Vec<PeerId> = config.others().collect();
        assert_eq!(others, vec![PeerId(0), PeerId(2)]);
    }

    #[test]
    fn test_invalid_id_out_of_range() {
        let mut config = three_peer_config();
        config.id = PeerId(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_heartbeat_too_long() {
        let mut config = three_peer_config();
        config.heartbeat_interval = Duration::from_millis(600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = three_peer_config();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
