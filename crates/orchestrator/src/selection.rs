//! Peer selection strategies.
//!
//! Selection filters the match list (stake, latency zone), optionally
//! boosts scores for staked peers, then applies one of five strategies.
//! Randomized strategies draw from the caller's RNG so tests stay
//! deterministic; production paths use the thread RNG (a CSPRNG).

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use rand::seq::SliceRandom;

use agora_overlay::{PeerInfo, PeerMatch};
use agora_primitives::PeerId;

use crate::load::AgentLoadState;

/// Hard cap on peers a single orchestration talks to.
pub const MAX_FANOUT: usize = 33;

/// How to choose among the filtered matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionStrategy {
    /// Everyone, up to [`MAX_FANOUT`].
    All,
    /// First N by match score; ties preserve overlay order.
    #[default]
    TopN,
    /// Least recently used first.
    RoundRobin,
    /// Uniform Fisher–Yates sample.
    Random,
    /// Weighted draw without replacement by score and load.
    Weighted,
}

/// Predicate over a peer's advertisement (stake checks).
pub type StakePredicate = Arc<dyn Fn(&PeerInfo) -> bool + Send + Sync>;

/// Selection configuration.
#[derive(Clone, Default)]
pub struct SelectionConfig {
    /// The strategy to apply after filtering.
    pub strategy: SelectionStrategy,
    /// How many peers to pick (clamped to [`MAX_FANOUT`]).
    pub count: usize,
    /// Weight load into the weighted strategy.
    pub load_balancing: bool,
    /// Blend between match score and load factor, clamped to `[0, 1]`.
    pub load_weight: f64,
    /// Keep only peers passing this predicate.
    pub stake_filter: Option<StakePredicate>,
    /// Score bonus for peers with stake present.
    pub stake_boost: f64,
    /// Drop peers whose latency EWMA exceeds this, ms.
    pub max_latency_ms: Option<f64>,
}

impl std::fmt::Debug for SelectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionConfig")
            .field("strategy", &self.strategy)
            .field("count", &self.count)
            .field("load_balancing", &self.load_balancing)
            .field("load_weight", &self.load_weight)
            .field("stake_filter", &self.stake_filter.is_some())
            .field("stake_boost", &self.stake_boost)
            .field("max_latency_ms", &self.max_latency_ms)
            .finish()
    }
}

impl SelectionConfig {
    /// Top-N selection of `count` peers.
    pub fn top_n(count: usize) -> Self {
        Self {
            strategy: SelectionStrategy::TopN,
            count,
            ..Default::default()
        }
    }
}

/// Select peers with the thread RNG.
pub fn select_peers(
    matches: &[PeerMatch],
    loads: &HashMap<PeerId, AgentLoadState>,
    config: &SelectionConfig,
) -> Vec<PeerMatch> {
    select_peers_with_rng(matches, loads, config, &mut rand::rng())
}

/// Select peers from a caller-supplied RNG.
pub fn select_peers_with_rng<R: Rng>(
    matches: &[PeerMatch],
    loads: &HashMap<PeerId, AgentLoadState>,
    config: &SelectionConfig,
    rng: &mut R,
) -> Vec<PeerMatch> {
    let mut candidates: Vec<PeerMatch> = matches.to_vec();

    if let Some(filter) = &config.stake_filter {
        candidates.retain(|m| filter(&m.peer));
    }
    if config.stake_boost > 0.0 {
        for candidate in &mut candidates {
            if candidate.peer.stake.is_some() {
                candidate.match_score = (candidate.match_score + config.stake_boost).min(1.0);
            }
        }
    }
    if let Some(max_latency) = config.max_latency_ms {
        candidates.retain(|m| {
            loads
                .get(&m.peer.peer_id)
                .is_none_or(|l| l.average_latency <= max_latency)
        });
    }

    let count = config.count.clamp(1, MAX_FANOUT);
    match config.strategy {
        SelectionStrategy::All => {
            candidates.truncate(MAX_FANOUT);
            candidates
        }
        SelectionStrategy::TopN => {
            // Stable sort keeps overlay order between equal scores.
            candidates.sort_by(|a, b| b.match_score.total_cmp(&a.match_score));
            candidates.truncate(count);
            candidates
        }
        SelectionStrategy::RoundRobin => {
            candidates.sort_by_key(|m| {
                loads
                    .get(&m.peer.peer_id)
                    .map(|l| l.last_request_time)
                    .unwrap_or(0)
            });
            candidates.truncate(count);
            candidates
        }
        SelectionStrategy::Random => {
            candidates.shuffle(rng);
            candidates.truncate(count);
            candidates
        }
        SelectionStrategy::Weighted => weighted_draw(candidates, loads, config, count, rng),
    }
}

/// Draw without replacement, weighting each candidate by
/// `score * (1 - w) + load_factor * w`.
fn weighted_draw<R: Rng>(
    mut remaining: Vec<PeerMatch>,
    loads: &HashMap<PeerId, AgentLoadState>,
    config: &SelectionConfig,
    count: usize,
    rng: &mut R,
) -> Vec<PeerMatch> {
    let load_weight = config.load_weight.clamp(0.0, 1.0);
    let mut picked = Vec::with_capacity(count.min(remaining.len()));

    while picked.len() < count && !remaining.is_empty() {
        let weights: Vec<f64> = remaining
            .iter()
            .map(|m| {
                let load_factor = if config.load_balancing {
                    let active = loads
                        .get(&m.peer.peer_id)
                        .map(|l| l.active_requests)
                        .unwrap_or(0);
                    1.0 / (active as f64 + 1.0)
                } else {
                    1.0
                };
                m.match_score * (1.0 - load_weight) + load_factor * load_weight
            })
            .collect();

        let total: f64 = weights.iter().sum();
        let index = if total <= 0.0 {
            // Degenerate weights: fall back to a uniform pick.
            rng.random_range(0..remaining.len())
        } else {
            let mut ticket = rng.random_range(0.0..total);
            weights
                .iter()
                .position(|w| {
                    ticket -= w;
                    ticket < 0.0
                })
                .unwrap_or(remaining.len() - 1)
        };
        picked.push(remaining.remove(index));
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn peer_match(score: f64) -> PeerMatch {
        PeerMatch {
            peer: PeerInfo::new(PeerId::random(), vec!["agent".into()]),
            match_score: score,
        }
    }

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_all_caps_at_max_fanout() {
        let matches: Vec<PeerMatch> = (0..50).map(|_| peer_match(1.0)).collect();
        let config = SelectionConfig {
            strategy: SelectionStrategy::All,
            count: 50,
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &HashMap::new(), &config, &mut rng());
        assert_eq!(selected.len(), MAX_FANOUT);
    }

    #[test]
    fn test_top_n_orders_by_score_preserving_ties() {
        let matches = vec![
            peer_match(0.5),
            peer_match(0.9),
            peer_match(0.5),
            peer_match(0.7),
        ];
        let config = SelectionConfig::top_n(3);
        let selected = select_peers_with_rng(&matches, &HashMap::new(), &config, &mut rng());

        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].peer.peer_id, matches[1].peer.peer_id);
        assert_eq!(selected[1].peer.peer_id, matches[3].peer.peer_id);
        // The 0.5 tie resolves to the earlier match.
        assert_eq!(selected[2].peer.peer_id, matches[0].peer.peer_id);
    }

    #[test]
    fn test_round_robin_prefers_least_recent() {
        let matches = vec![peer_match(1.0), peer_match(1.0), peer_match(1.0)];
        let mut loads = HashMap::new();
        loads.insert(
            matches[0].peer.peer_id,
            AgentLoadState {
                last_request_time: 300,
                ..Default::default()
            },
        );
        loads.insert(
            matches[1].peer.peer_id,
            AgentLoadState {
                last_request_time: 100,
                ..Default::default()
            },
        );
        loads.insert(
            matches[2].peer.peer_id,
            AgentLoadState {
                last_request_time: 200,
                ..Default::default()
            },
        );

        let config = SelectionConfig {
            strategy: SelectionStrategy::RoundRobin,
            count: 2,
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &loads, &config, &mut rng());
        assert_eq!(selected[0].peer.peer_id, matches[1].peer.peer_id);
        assert_eq!(selected[1].peer.peer_id, matches[2].peer.peer_id);
    }

    #[test]
    fn test_random_takes_count_without_duplicates() {
        let matches: Vec<PeerMatch> = (0..10).map(|_| peer_match(1.0)).collect();
        let config = SelectionConfig {
            strategy: SelectionStrategy::Random,
            count: 4,
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &HashMap::new(), &config, &mut rng());

        assert_eq!(selected.len(), 4);
        let mut ids: Vec<PeerId> = selected.iter().map(|m| m.peer.peer_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_weighted_draws_without_replacement() {
        let matches: Vec<PeerMatch> = (0..6).map(|i| peer_match(0.2 + 0.1 * i as f64)).collect();
        let config = SelectionConfig {
            strategy: SelectionStrategy::Weighted,
            count: 6,
            load_balancing: true,
            load_weight: 0.5,
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &HashMap::new(), &config, &mut rng());

        assert_eq!(selected.len(), 6);
        let mut ids: Vec<PeerId> = selected.iter().map(|m| m.peer.peer_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn test_weighted_zero_total_falls_back_to_uniform() {
        let matches = vec![peer_match(0.0), peer_match(0.0)];
        let config = SelectionConfig {
            strategy: SelectionStrategy::Weighted,
            count: 1,
            load_balancing: false,
            load_weight: 0.0,
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &HashMap::new(), &config, &mut rng());
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_weighted_load_balancing_prefers_idle_peers() {
        // Equal scores; one peer is saturated. Over many seeded draws the
        // idle peer must win most of the time.
        let matches = vec![peer_match(0.8), peer_match(0.8)];
        let mut loads = HashMap::new();
        loads.insert(
            matches[0].peer.peer_id,
            AgentLoadState {
                active_requests: 9,
                ..Default::default()
            },
        );

        let config = SelectionConfig {
            strategy: SelectionStrategy::Weighted,
            count: 1,
            load_balancing: true,
            load_weight: 1.0,
            ..Default::default()
        };

        let mut idle_wins = 0;
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let selected = select_peers_with_rng(&matches, &loads, &config, &mut rng);
            if selected[0].peer.peer_id == matches[1].peer.peer_id {
                idle_wins += 1;
            }
        }
        assert!(idle_wins > 80, "idle peer won only {idle_wins}/100 draws");
    }

    #[test]
    fn test_stake_filter_and_boost() {
        let mut staked = peer_match(0.5);
        staked.peer.stake = Some(U256::from(1000u64));
        let unstaked = peer_match(0.9);
        let matches = vec![unstaked, staked.clone()];

        // Filter keeps only staked peers.
        let config = SelectionConfig {
            strategy: SelectionStrategy::All,
            count: 2,
            stake_filter: Some(Arc::new(|p: &PeerInfo| p.stake.is_some())),
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &HashMap::new(), &config, &mut rng());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].peer.peer_id, staked.peer.peer_id);

        // Boost lifts the staked peer above the unstaked one.
        let config = SelectionConfig {
            strategy: SelectionStrategy::TopN,
            count: 1,
            stake_boost: 0.6,
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &HashMap::new(), &config, &mut rng());
        assert_eq!(selected[0].peer.peer_id, staked.peer.peer_id);
        assert_eq!(selected[0].match_score, 1.0);
    }

    #[test]
    fn test_latency_zone_filter() {
        let matches = vec![peer_match(1.0), peer_match(1.0)];
        let mut loads = HashMap::new();
        loads.insert(
            matches[0].peer.peer_id,
            AgentLoadState {
                average_latency: 900.0,
                ..Default::default()
            },
        );

        let config = SelectionConfig {
            strategy: SelectionStrategy::All,
            count: 2,
            max_latency_ms: Some(500.0),
            ..Default::default()
        };
        let selected = select_peers_with_rng(&matches, &loads, &config, &mut rng());
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].peer.peer_id, matches[1].peer.peer_id);
    }
}
