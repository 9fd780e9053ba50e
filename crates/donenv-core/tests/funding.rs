//! Funding across read-only and writable chains

use donenv_core::chain::{ChainClient, WrappedBlockchainOutput};
use donenv_core::infra::InfraInput;
use donenv_core::stages::{fund_nodes, FundingAmounts};
use donenv_core::{build_topology, CapabilityFlag, NodeSetInput, Topology};
use donenv_test_utils::{endpoints, FakeEvmClient};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CHAIN_A: u64 = 1337;
const CHAIN_B: u64 = 2337;

fn two_node_topology() -> Topology {
    let set = NodeSetInput::new("workflow", 2).with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway]);
    let mut topology = build_topology(&[set], &InfraInput::Docker, CHAIN_A).unwrap();
    for node in &mut topology.dons[0].nodes {
        for chain_id in [CHAIN_A, CHAIN_B] {
            node.addresses
                .insert(chain_id, format!("0x{:040x}", chain_id * 10 + node.index as u64));
        }
    }
    topology
}

fn chain(client: &Arc<FakeEvmClient>, chain_id: u64, read_only: bool) -> WrappedBlockchainOutput {
    WrappedBlockchainOutput {
        chain_id,
        chain_selector: chain_id,
        read_only,
        endpoints: endpoints(chain_id),
        client: ChainClient::Evm(Arc::clone(client) as _),
    }
}

#[tokio::test]
async fn only_the_writable_chain_is_funded() {
    let a = Arc::new(FakeEvmClient::new(CHAIN_A, 0));
    let b = Arc::new(FakeEvmClient::new(CHAIN_B, 41));
    let outputs = vec![chain(&a, CHAIN_A, true), chain(&b, CHAIN_B, false)];

    fund_nodes(
        &two_node_topology(),
        &outputs,
        FundingAmounts::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(a.sent.lock().is_empty());
    assert_eq!(b.sent_nonces(), vec![41, 42]);

    let mut recipients: Vec<String> = b.sent.lock().iter().map(|sent| sent.to.clone()).collect();
    recipients.sort();
    assert_eq!(
        recipients,
        vec![format!("0x{:040x}", CHAIN_B * 10), format!("0x{:040x}", CHAIN_B * 10 + 1)]
    );
    assert!(b
        .sent
        .lock()
        .iter()
        .all(|sent| sent.amount == FundingAmounts::default().evm_wei));
}
