//! Property tests for topology construction and nonce allocation

use donenv_core::infra::{InfraInput, NodeRole};
use donenv_core::{build_topology, CapabilityFlag, ConcurrentNonceMap, NodeSetInput};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn node_sets(workflow_nodes: usize, capability_nodes: Vec<usize>, bootstrap: bool) -> Vec<NodeSetInput> {
    let mut sets = vec![NodeSetInput::new("workflow", workflow_nodes)
        .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway])
        .with_capabilities([CapabilityFlag::Ocr3])];
    for (position, count) in capability_nodes.into_iter().enumerate() {
        sets.push(
            NodeSetInput::new(format!("capabilities{position}"), count)
                .with_don_types([CapabilityFlag::Capabilities])
                .with_capabilities([CapabilityFlag::WriteEvm])
                .with_bootstrap_index(if bootstrap { 0 } else { -1 }),
        );
    }
    sets
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn topology_only_depends_on_inputs(
        workflow in 1usize..8,
        capabilities in proptest::collection::vec(1usize..6, 0..4),
        bootstrap in any::<bool>(),
    ) {
        let sets = node_sets(workflow, capabilities, bootstrap);
        let first = build_topology(&sets, &InfraInput::Docker, 42).unwrap();
        let second = build_topology(&sets, &InfraInput::Docker, 42).unwrap();
        prop_assert_eq!(&first, &second);

        let ids: Vec<u32> = first.dons.iter().map(|don| don.id).collect();
        let expected: Vec<u32> = (1..=u32::try_from(sets.len()).unwrap()).collect();
        prop_assert_eq!(ids, expected);
        prop_assert_eq!(first.workflow_don_id, 1);
        prop_assert_eq!(first.node_count(), sets.iter().map(|set| set.nodes.len()).sum::<usize>());
    }

    #[test]
    fn at_most_one_bootstrap_per_don(
        workflow in 1usize..8,
        capabilities in proptest::collection::vec(1usize..6, 0..4),
        bootstrap in any::<bool>(),
    ) {
        let sets = node_sets(workflow, capabilities, bootstrap);
        let topology = build_topology(&sets, &InfraInput::Docker, 42).unwrap();

        for don in &topology.dons {
            let bootstraps = don.nodes.iter().filter(|node| node.role == NodeRole::Bootstrap).count();
            prop_assert!(bootstraps <= 1);

            let hosts: BTreeSet<&str> = don.nodes.iter().map(|node| node.host.as_str()).collect();
            prop_assert_eq!(hosts.len(), don.nodes.len());
        }
    }

    #[test]
    fn concurrent_increments_are_unique_and_consecutive(start in 0u64..1_000_000, tasks in 1usize..64) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .build()
            .unwrap();

        let mut nonces = runtime.block_on(async move {
            let map = Arc::new(ConcurrentNonceMap::from_values([(1337, start)]));
            let handles: Vec<_> = (0..tasks)
                .map(|_| {
                    let map = Arc::clone(&map);
                    tokio::spawn(async move { map.increment(1337).unwrap() })
                })
                .collect();

            let mut nonces = Vec::with_capacity(handles.len());
            for handle in handles {
                nonces.push(handle.await.unwrap());
            }
            nonces
        });

        nonces.sort_unstable();
        let expected: Vec<u64> = (start + 1..=start + tasks as u64).collect();
        prop_assert_eq!(nonces, expected);
    }
}

#[test]
fn decrement_then_increment_starts_at_the_pending_nonce() {
    let map = ConcurrentNonceMap::from_values([(1337, 0)]);
    map.decrement(1337).unwrap();

    assert_eq!(map.increment(1337).unwrap(), 0);
    assert_eq!(map.increment(1337).unwrap(), 1);
}
