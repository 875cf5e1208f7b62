//! Consensus fan-out and aggregation
//!
//! The identical prompt goes to every endpoint in parallel with a per-node
//! timeout; no node's slowness blocks the others' results from being
//! collected. The aggregation step runs once the last leg settles, then the
//! quorum and supermajority gates decide.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::node::{parse_verdict, VerdictTransport};
use super::{
    build_prompt, ConsensusContext, ConsensusPanel, ConsensusTranscript, NodeRecord, QUORUM_FLOOR,
};
use crate::config::LlmEndpointConfig;
use crate::types::{AidClass, FulfillerClass, Result as CorridorResult};

/// Heterogeneous LLM panel engine
pub struct ConsensusEngine {
    endpoints: Vec<LlmEndpointConfig>,
    transport: Arc<dyn VerdictTransport>,
    per_node_timeout: Duration,
}

impl ConsensusEngine {
    pub fn new(
        endpoints: Vec<LlmEndpointConfig>,
        transport: Arc<dyn VerdictTransport>,
        per_node_timeout: Duration,
    ) -> Self {
        Self {
            endpoints,
            transport,
            per_node_timeout,
        }
    }

    async fn poll_node(&self, endpoint: &LlmEndpointConfig, prompt: &str) -> NodeRecord {
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.per_node_timeout, self.transport.complete(endpoint, prompt))
                .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let raw = match outcome {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                warn!(node = %endpoint.id, error = %e, "Panel node failed");
                return NodeRecord::invalid(endpoint, latency_ms, e);
            }
            Err(_) => {
                warn!(node = %endpoint.id, timeout_ms = latency_ms, "Panel node timed out");
                return NodeRecord::invalid(endpoint, latency_ms, "timed out".to_string());
            }
        };

        match parse_verdict(&raw) {
            Ok(verdict) => {
                debug!(
                    node = %endpoint.id,
                    approved = verdict.approved,
                    cost = verdict.estimated_cost,
                    latency_ms,
                    "Panel verdict"
                );
                NodeRecord {
                    node_id: endpoint.id.clone(),
                    model: endpoint.model.clone(),
                    valid: true,
                    approved: verdict.approved,
                    recommended_aid: AidClass::from_wire(verdict.recommended_aid),
                    fulfiller_class: FulfillerClass::from_wire(verdict.fulfiller_type),
                    estimated_cost: Some(verdict.estimated_cost),
                    confidence: Some(verdict.confidence),
                    latency_ms,
                    error: None,
                }
            }
            Err(e) => {
                warn!(node = %endpoint.id, error = %e, "Unparseable verdict");
                NodeRecord::invalid(endpoint, latency_ms, e)
            }
        }
    }
}

impl NodeRecord {
    fn invalid(endpoint: &LlmEndpointConfig, latency_ms: u64, error: String) -> Self {
        Self {
            node_id: endpoint.id.clone(),
            model: endpoint.model.clone(),
            valid: false,
            approved: false,
            recommended_aid: None,
            fulfiller_class: None,
            estimated_cost: None,
            confidence: None,
            latency_ms,
            error: Some(error),
        }
    }
}

#[async_trait]
impl ConsensusPanel for ConsensusEngine {
    async fn run_consensus(&self, ctx: &ConsensusContext) -> CorridorResult<ConsensusTranscript> {
        let prompt = build_prompt(ctx);

        let polls = self
            .endpoints
            .iter()
            .map(|endpoint| self.poll_node(endpoint, &prompt));
        let nodes = join_all(polls).await;

        let transcript = aggregate(nodes);
        info!(
            request_id = ctx.request.id,
            nodes = transcript.node_count,
            valid = transcript.valid_count,
            approvals = transcript.approval_count,
            approved = transcript.approved,
            cost = ?transcript.estimated_cost,
            "Consensus complete"
        );
        Ok(transcript)
    }
}

/// Aggregate node records into a transcript.
///
/// Quorum first, then the strict two-thirds supermajority over valid nodes
/// (the same check the ledger performs); choices are aggregated over
/// approving nodes only.
pub fn aggregate(nodes: Vec<NodeRecord>) -> ConsensusTranscript {
    let node_count = nodes.len() as u32;
    let valid_count = nodes.iter().filter(|n| n.valid).count() as u32;
    let approval_count = nodes.iter().filter(|n| n.valid && n.approved).count() as u32;

    if valid_count < QUORUM_FLOOR {
        return ConsensusTranscript {
            node_count,
            valid_count,
            approval_count,
            approved: false,
            reason: Some(format!(
                "insufficient nodes: {} valid, quorum floor is {}",
                valid_count, QUORUM_FLOOR
            )),
            aid_class: None,
            fulfiller_class: None,
            estimated_cost: None,
            avg_confidence_bp: 0,
            nodes,
        };
    }

    // Strict two-thirds of valid nodes
    let approved = 3 * approval_count > 2 * valid_count;
    if !approved {
        return ConsensusTranscript {
            node_count,
            valid_count,
            approval_count,
            approved: false,
            reason: Some(format!(
                "supermajority not reached: {} of {} valid nodes approved",
                approval_count, valid_count
            )),
            aid_class: None,
            fulfiller_class: None,
            estimated_cost: None,
            avg_confidence_bp: 0,
            nodes,
        };
    }

    let approvers: Vec<&NodeRecord> = nodes.iter().filter(|n| n.valid && n.approved).collect();

    let aid_class = plurality(approvers.iter().filter_map(|n| n.recommended_aid), |c| {
        c.to_wire()
    })
    .and_then(AidClass::from_wire);
    let fulfiller_class = plurality(approvers.iter().filter_map(|n| n.fulfiller_class), |c| {
        c.to_wire()
    })
    .and_then(FulfillerClass::from_wire);

    let mut costs: Vec<u64> = approvers.iter().filter_map(|n| n.estimated_cost).collect();
    let estimated_cost = lower_median(&mut costs);

    let confidences: Vec<u64> = approvers
        .iter()
        .filter_map(|n| n.confidence.map(u64::from))
        .collect();
    let avg_confidence_bp = if confidences.is_empty() {
        0
    } else {
        (confidences.iter().sum::<u64>() * 100 / confidences.len() as u64) as u32
    };

    ConsensusTranscript {
        node_count,
        valid_count,
        approval_count,
        approved: true,
        reason: None,
        aid_class,
        fulfiller_class,
        estimated_cost,
        avg_confidence_bp,
        nodes,
    }
}

/// Plurality vote over categorical labels; ties break to the lowest wire
/// value so the result is deterministic.
fn plurality<T: Copy, I: Iterator<Item = T>>(items: I, wire: impl Fn(T) -> u8) -> Option<u8> {
    let mut counts = [0usize; 8];
    let mut any = false;
    for item in items {
        counts[wire(item) as usize] += 1;
        any = true;
    }
    if !any {
        return None;
    }
    let mut best: u8 = 0;
    for (value, &count) in counts.iter().enumerate() {
        if count > counts[best as usize] {
            best = value as u8;
        }
    }
    Some(best)
}

/// Median; even count takes the lower of the two middle values
fn lower_median(values: &mut [u64]) -> Option<u64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    Some(values[(values.len() - 1) / 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_node(id: &str, approved: bool, aid: AidClass, fulfiller: FulfillerClass, cost: u64, confidence: u8) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            model: format!("model-{}", id),
            valid: true,
            approved,
            recommended_aid: Some(aid),
            fulfiller_class: Some(fulfiller),
            estimated_cost: Some(cost),
            confidence: Some(confidence),
            latency_ms: 900,
            error: None,
        }
    }

    fn invalid_node(id: &str) -> NodeRecord {
        NodeRecord {
            node_id: id.to_string(),
            model: format!("model-{}", id),
            valid: false,
            approved: false,
            recommended_aid: None,
            fulfiller_class: None,
            estimated_cost: None,
            confidence: None,
            latency_ms: 30_000,
            error: Some("timed out".to_string()),
        }
    }

    #[test]
    fn test_unanimous_panel_approves_with_median_cost() {
        // Costs {120, 140, 150, 160, 200}: median 150
        let costs = [120u64, 140, 150, 160, 200];
        let nodes = costs
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                valid_node(&format!("n{}", i), true, AidClass::Medical, FulfillerClass::Aerial, c, 80 + i as u8)
            })
            .collect();
        let t = aggregate(nodes);
        assert!(t.approved);
        assert_eq!(t.estimated_cost, Some(150));
        assert_eq!(t.aid_class, Some(AidClass::Medical));
        assert_eq!(t.fulfiller_class, Some(FulfillerClass::Aerial));
        assert_eq!(t.valid_count, 5);
        assert_eq!(t.approval_count, 5);
        // Mean of 80..=84 is 82 -> 8200 bp
        assert_eq!(t.avg_confidence_bp, 8200);
    }

    #[test]
    fn test_three_of_five_fails_strict_supermajority() {
        // 3*3 = 9 is not > 2*5 = 10
        let mut nodes: Vec<NodeRecord> = (0..3)
            .map(|i| valid_node(&format!("a{}", i), true, AidClass::Medical, FulfillerClass::Aerial, 100, 80))
            .collect();
        nodes.push(valid_node("r0", false, AidClass::Medical, FulfillerClass::Aerial, 100, 60));
        nodes.push(valid_node("r1", false, AidClass::Medical, FulfillerClass::Aerial, 100, 60));
        let t = aggregate(nodes);
        assert!(!t.approved);
        assert_eq!(t.approval_count, 3);
        assert_eq!(t.valid_count, 5);
        assert!(t.reason.unwrap().contains("supermajority"));
        assert!(t.estimated_cost.is_none());
    }

    #[test]
    fn test_four_of_five_passes() {
        // 3*4 = 12 > 2*5 = 10
        let mut nodes: Vec<NodeRecord> = (0..4)
            .map(|i| valid_node(&format!("a{}", i), true, AidClass::Food, FulfillerClass::Human, 90, 75))
            .collect();
        nodes.push(valid_node("r0", false, AidClass::Food, FulfillerClass::Human, 90, 50));
        assert!(aggregate(nodes).approved);
    }

    #[test]
    fn test_invalid_nodes_do_not_count_toward_quorum() {
        let nodes = vec![
            valid_node("a", true, AidClass::Medical, FulfillerClass::Aerial, 100, 90),
            valid_node("b", true, AidClass::Medical, FulfillerClass::Aerial, 100, 90),
            invalid_node("c"),
            invalid_node("d"),
            invalid_node("e"),
        ];
        let t = aggregate(nodes);
        assert!(!t.approved);
        assert_eq!(t.valid_count, 2);
        assert!(t.reason.unwrap().contains("insufficient nodes"));
    }

    #[test]
    fn test_two_of_two_valid_below_quorum_floor() {
        // Unanimous but below the floor of 3
        let nodes = vec![
            valid_node("a", true, AidClass::Medical, FulfillerClass::Aerial, 100, 90),
            valid_node("b", true, AidClass::Medical, FulfillerClass::Aerial, 100, 90),
        ];
        assert!(!aggregate(nodes).approved);
    }

    #[test]
    fn test_supermajority_invariant_on_approval() {
        // Any approved transcript satisfies 3*approvals > 2*valid and quorum
        for approvals in 0..=7u32 {
            let mut nodes: Vec<NodeRecord> = (0..approvals)
                .map(|i| valid_node(&format!("a{}", i), true, AidClass::Rescue, FulfillerClass::Human, 50, 70))
                .collect();
            for i in approvals..7 {
                nodes.push(valid_node(&format!("r{}", i), false, AidClass::Rescue, FulfillerClass::Human, 50, 70));
            }
            let t = aggregate(nodes);
            if t.approved {
                assert!(3 * t.approval_count > 2 * t.valid_count);
                assert!(t.valid_count >= QUORUM_FLOOR);
            }
        }
    }

    #[test]
    fn test_plurality_tie_breaks_to_lowest_class() {
        // 2x medical (0), 2x food (1): tie resolves to medical
        let nodes = vec![
            valid_node("a", true, AidClass::Food, FulfillerClass::Aerial, 100, 80),
            valid_node("b", true, AidClass::Medical, FulfillerClass::Aerial, 100, 80),
            valid_node("c", true, AidClass::Food, FulfillerClass::Aerial, 100, 80),
            valid_node("d", true, AidClass::Medical, FulfillerClass::Aerial, 100, 80),
        ];
        let t = aggregate(nodes);
        assert!(t.approved);
        assert_eq!(t.aid_class, Some(AidClass::Medical));
    }

    #[test]
    fn test_lower_median_even_count() {
        let mut values = [100u64, 400, 200, 300];
        assert_eq!(lower_median(&mut values), Some(200));
        let mut one = [70u64];
        assert_eq!(lower_median(&mut one), Some(70));
        let mut none: [u64; 0] = [];
        assert_eq!(lower_median(&mut none), None);
    }

    #[test]
    fn test_median_resists_outlier() {
        // One node estimating 100x the others must not move the choice much
        let nodes = vec![
            valid_node("a", true, AidClass::Medical, FulfillerClass::Aerial, 100, 80),
            valid_node("b", true, AidClass::Medical, FulfillerClass::Aerial, 120, 80),
            valid_node("c", true, AidClass::Medical, FulfillerClass::Aerial, 110, 80),
            valid_node("d", true, AidClass::Medical, FulfillerClass::Aerial, 12_000, 80),
        ];
        let t = aggregate(nodes);
        assert_eq!(t.estimated_cost, Some(110));
    }
}
