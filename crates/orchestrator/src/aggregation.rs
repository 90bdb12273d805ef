//! Response aggregation strategies.
//!
//! Pure, synchronous reductions from many peer responses to one result.
//! Each strategy yields a result, a confidence in `[0, 1]`, and the number
//! of agreeing responses; the caller compares confidence against its
//! consensus threshold.

use std::sync::Arc;

use crate::AgentResponse;

/// A reduction over successful responses.
pub type CustomAggregator = Arc<dyn Fn(&[AgentResponse]) -> AggregationOutcome + Send + Sync>;

/// How to reduce many responses into one.
#[derive(Clone, Default)]
pub enum AggregationStrategy {
    /// Most common answer wins.
    #[default]
    MajorityVote,
    /// Answers weighted by match score.
    WeightedVote,
    /// The single answer from the best-matched peer.
    BestScore,
    /// All distinct answers concatenated.
    Ensemble,
    /// Majority with aggressive normalization, for threshold gating.
    ConsensusThreshold,
    /// The fastest answer.
    FirstResponse,
    /// The longest answer.
    Longest,
    /// The richest phrasing of the majority answer.
    SynthesizedConsensus,
    /// Caller-supplied reduction.
    Custom(CustomAggregator),
}

impl std::fmt::Debug for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MajorityVote => "majority-vote",
            Self::WeightedVote => "weighted-vote",
            Self::BestScore => "best-score",
            Self::Ensemble => "ensemble",
            Self::ConsensusThreshold => "consensus-threshold",
            Self::FirstResponse => "first-response",
            Self::Longest => "longest",
            Self::SynthesizedConsensus => "synthesized-consensus",
            Self::Custom(_) => "custom",
        };
        f.write_str(name)
    }
}

/// What a strategy produces.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOutcome {
    /// The aggregated result text.
    pub result: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Responses agreeing with the result.
    pub agreement_count: usize,
}

/// Errors from aggregation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    /// Nothing to aggregate.
    #[error("no successful responses to aggregate")]
    NoSuccessfulResponses,
}

/// Reduce `responses` with `strategy`.
///
/// Failed responses contribute to denominators but never to results.
pub fn aggregate(
    responses: &[AgentResponse],
    strategy: &AggregationStrategy,
) -> Result<AggregationOutcome, AggregationError> {
    let successful: Vec<&AgentResponse> = responses.iter().filter(|r| r.success).collect();
    if successful.is_empty() {
        return Err(AggregationError::NoSuccessfulResponses);
    }

    let outcome = match strategy {
        AggregationStrategy::MajorityVote => majority(&successful, normalize_exact),
        AggregationStrategy::ConsensusThreshold => majority(&successful, normalize_loose),
        AggregationStrategy::WeightedVote => weighted_vote(&successful),
        AggregationStrategy::BestScore => best_score(&successful),
        AggregationStrategy::Ensemble => ensemble(&successful, responses.len()),
        AggregationStrategy::FirstResponse => first_response(&successful),
        AggregationStrategy::Longest => longest(&successful),
        AggregationStrategy::SynthesizedConsensus => synthesized(&successful),
        AggregationStrategy::Custom(aggregator) => {
            let owned: Vec<AgentResponse> = successful.iter().map(|r| (*r).clone()).collect();
            aggregator(&owned)
        }
    };
    Ok(outcome)
}

fn text(response: &AgentResponse) -> &str {
    response.response.as_deref().unwrap_or_default()
}

fn normalize_exact(s: &str) -> String {
    s.trim().to_owned()
}

fn normalize_loose(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Group by normalized text; the largest group wins, ties go to the group
/// seen first.
fn group_by<'a>(
    successful: &[&'a AgentResponse],
    normalize: fn(&str) -> String,
) -> Vec<(String, Vec<&'a AgentResponse>)> {
    let mut groups: Vec<(String, Vec<&AgentResponse>)> = Vec::new();
    for &response in successful {
        let key = normalize(text(response));
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(response),
            None => groups.push((key, vec![response])),
        }
    }
    groups
}

fn majority(successful: &[&AgentResponse], normalize: fn(&str) -> String) -> AggregationOutcome {
    let groups = group_by(successful, normalize);
    let members = groups
        .iter()
        .max_by_key(|(_, members)| members.len())
        .map(|(_, members)| members.as_slice())
        .unwrap_or_default();
    let agreement_count = members.len();
    AggregationOutcome {
        result: members.first().map(|r| text(r).to_owned()).unwrap_or_default(),
        confidence: agreement_count as f64 / successful.len() as f64,
        agreement_count,
    }
}

fn weighted_vote(successful: &[&AgentResponse]) -> AggregationOutcome {
    let mut groups: Vec<(String, Vec<&AgentResponse>, f64)> = Vec::new();
    let mut total_weight = 0.0f64;
    for &response in successful {
        let weight = response.match_score.max(0.0);
        total_weight += weight;
        let key = normalize_exact(text(response));
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some((_, members, group_weight)) => {
                members.push(response);
                *group_weight += weight;
            }
            None => groups.push((key, vec![response], weight)),
        }
    }

    let Some((_, members, weight)) = groups.iter().max_by(|a, b| a.2.total_cmp(&b.2)) else {
        return AggregationOutcome {
            result: String::new(),
            confidence: 0.0,
            agreement_count: 0,
        };
    };
    AggregationOutcome {
        result: members.first().map(|r| text(r).to_owned()).unwrap_or_default(),
        confidence: if total_weight > 0.0 {
            *weight / total_weight
        } else {
            members.len() as f64 / successful.len() as f64
        },
        agreement_count: members.len(),
    }
}

fn best_score(successful: &[&AgentResponse]) -> AggregationOutcome {
    let best = successful
        .iter()
        .copied()
        .max_by(|a, b| a.match_score.total_cmp(&b.match_score));
    AggregationOutcome {
        result: best.map(|r| text(r).to_owned()).unwrap_or_default(),
        confidence: best.map(|r| r.match_score.clamp(0.0, 1.0)).unwrap_or(0.0),
        agreement_count: 1,
    }
}

fn ensemble(successful: &[&AgentResponse], total: usize) -> AggregationOutcome {
    let mut distinct: Vec<&str> = Vec::new();
    for &response in successful {
        let t = text(response);
        if !distinct.contains(&t) {
            distinct.push(t);
        }
    }
    AggregationOutcome {
        result: distinct.join("\n\n"),
        confidence: successful.len() as f64 / total.max(1) as f64,
        agreement_count: successful.len(),
    }
}

fn first_response(successful: &[&AgentResponse]) -> AggregationOutcome {
    let fastest = successful
        .iter()
        .copied()
        .min_by(|a, b| a.latency_ms.total_cmp(&b.latency_ms));
    AggregationOutcome {
        result: fastest.map(|r| text(r).to_owned()).unwrap_or_default(),
        confidence: 1.0 / successful.len() as f64,
        agreement_count: 1,
    }
}

fn longest(successful: &[&AgentResponse]) -> AggregationOutcome {
    let longest = successful.iter().copied().max_by_key(|r| text(r).len());
    AggregationOutcome {
        result: longest.map(|r| text(r).to_owned()).unwrap_or_default(),
        confidence: 1.0 / successful.len() as f64,
        agreement_count: 1,
    }
}

/// Majority vote, answering with the longest member of the winning group.
fn synthesized(successful: &[&AgentResponse]) -> AggregationOutcome {
    let groups = group_by(successful, normalize_loose);
    let members = groups
        .iter()
        .max_by_key(|(_, members)| members.len())
        .map(|(_, members)| members.as_slice())
        .unwrap_or_default();
    let richest = members.iter().copied().max_by_key(|r| text(r).len());
    AggregationOutcome {
        result: richest.map(|r| text(r).to_owned()).unwrap_or_default(),
        confidence: members.len() as f64 / successful.len() as f64,
        agreement_count: members.len(),
    }
}
