//! End-to-end node scenarios: query fan-out, aggregation, and the payment
//! loop between requester and answering peers.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use alloy_signer_local::PrivateKeySigner;

use agora_node::{AgoraNode, NodeConfig, ResponderFn};
use agora_orchestrator::{QueryConfig, ResponseConfig, SelectionConfig, SelectionStrategy};
use agora_overlay::{LocalOverlay, LocalOverlayNetwork, Overlay, PeerInfo};
use agora_primitives::{PeerId, records::LedgerStatus, wei};
use agora_settlement::{ChainBackend, SettlementConfig, mock::MockChainBackend};

struct Cluster {
    network: Arc<LocalOverlayNetwork>,
    backend: Arc<MockChainBackend>,
}

struct Node {
    node: Arc<AgoraNode>,
    overlay: Arc<LocalOverlay>,
    _dir: tempfile::TempDir,
}

impl Cluster {
    fn new() -> Self {
        Self {
            network: LocalOverlayNetwork::new(),
            backend: Arc::new(MockChainBackend::new(1)),
        }
    }

    fn spawn(
        &self,
        capabilities: &[&str],
        price_per_request: Option<&str>,
        responder: Option<ResponderFn>,
    ) -> Node {
        let signer = PrivateKeySigner::random();
        let peer = PeerId::new(signer.address());
        self.backend
            .fund(signer.address(), wei::WEI_PER_TOKEN * U256::from(100u64));

        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::new(dir.path())
            .with_capabilities(capabilities.iter().copied());
        if let Some(price) = price_per_request {
            config = config.with_price_per_request(price);
        }
        config.payment.payment_timeout = Duration::from_secs(5);
        config.settlement = SettlementConfig {
            receipt_poll_interval: Duration::from_millis(1),
            receipt_poll_attempts: 3,
            ..Default::default()
        };

        let overlay = Arc::new(self.network.join(PeerInfo::new(
            peer,
            capabilities.iter().map(|s| s.to_string()).collect(),
        )));
        let node = AgoraNode::launch(
            config,
            Arc::clone(&overlay) as Arc<dyn Overlay>,
            vec![Arc::clone(&self.backend) as Arc<dyn ChainBackend>],
            Some(signer),
            responder,
        )
        .unwrap();

        Node {
            node,
            overlay,
            _dir: dir,
        }
    }
}

fn answer(text: &'static str) -> Option<ResponderFn> {
    Some(Arc::new(move |_prompt: &str| text.to_owned()))
}

fn query_config(count: usize) -> QueryConfig {
    QueryConfig {
        capabilities: vec!["answer".into()],
        selection: SelectionConfig {
            strategy: SelectionStrategy::All,
            count,
            ..Default::default()
        },
        response: ResponseConfig {
            request_timeout: Duration::from_millis(400),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn happy_path_query_reaches_consensus() {
    let cluster = Cluster::new();
    let _w1 = cluster.spawn(&["answer"], None, answer("the answer is 42"));
    let _w2 = cluster.spawn(&["answer"], None, answer("the answer is 42"));
    let querier = cluster.spawn(&["query"], None, None);

    let result = querier
        .node
        .query("what is the answer", &query_config(2))
        .await
        .unwrap();

    assert_eq!(result.result, "the answer is 42");
    assert!(result.consensus_achieved);
    assert_eq!(result.metrics.total_agents, 2);
    assert_eq!(result.metrics.successful_agents, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_failure_still_aggregates() {
    let cluster = Cluster::new();
    let _w1 = cluster.spawn(&["answer"], None, answer("blue"));
    let _w2 = cluster.spawn(&["answer"], None, answer("blue"));
    let silent = cluster.spawn(&["answer"], None, None);
    let querier = cluster.spawn(&["query"], None, None);

    let result = querier
        .node
        .query("favorite color", &query_config(3))
        .await
        .unwrap();

    assert_eq!(result.result, "blue");
    assert_eq!(result.metrics.successful_agents, 2);
    assert_eq!(result.metrics.failed_agents, 1);

    let silent_peer = silent.overlay.local_peer();
    let state = querier.node.orchestrator().loads().get(&silent_peer);
    assert_eq!(state.total_errors, 1);
    assert!(state.success_rate < 1.0);
    assert_eq!(state.active_requests, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paid_query_settles_end_to_end() {
    let cluster = Cluster::new();
    let worker = cluster.spawn(&["answer"], Some("0.25"), answer("done"));
    let querier = cluster.spawn(&["query"], None, None);

    let querier_wallet = querier.node.payments().wallet();
    let worker_wallet = worker.node.payments().wallet();
    let balance_before = cluster.backend.balance(querier_wallet).await.unwrap();

    let result = querier.node.query("do the work", &query_config(1)).await.unwrap();
    assert_eq!(result.result, "done");

    // The worker invoices in the background; the querier's dispatcher pays
    // against the expected-invoice row the orchestrator wrote. Wait for
    // the proof to land on the worker.
    let mut settled = false;
    for _ in 0..100 {
        let entries = worker.node.payments().ledger().load_entries().unwrap();
        if entries.iter().any(|e| e.status == LedgerStatus::Settled) {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(settled, "worker never observed a settled payment");

    let paid = wei::to_wei("0.25").unwrap();
    assert_eq!(
        cluster.backend.balance(querier_wallet).await.unwrap(),
        balance_before - paid
    );
    assert_eq!(
        cluster.backend.balance(worker_wallet).await.unwrap(),
        wei::WEI_PER_TOKEN * U256::from(100u64) + paid
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsolicited_invoices_are_not_paid() {
    let cluster = Cluster::new();
    let freeloader = cluster.spawn(&["answer"], None, None);
    let querier = cluster.spawn(&["query"], None, None);

    let querier_wallet = querier.node.payments().wallet();
    let balance_before = cluster.backend.balance(querier_wallet).await.unwrap();

    // An invoice for a job the querier never requested.
    let invoice = agora_primitives::Invoice::new(
        "made-up-job",
        1,
        "ETH",
        None,
        "50",
        freeloader.node.payments().wallet(),
        60_000,
    );
    freeloader
        .overlay
        .send(
            querier.overlay.local_peer(),
            agora_primitives::AgentMessage::Invoice(invoice),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        cluster.backend.balance(querier_wallet).await.unwrap(),
        balance_before
    );
}
