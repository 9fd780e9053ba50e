//! Concurrent nonce allocation
//!
//! One map per funding round. Each funding task takes the next nonce for its
//! chain inside the same critical section that advances the counter, so no
//! two tasks ever see the same value.

use crate::chain::WrappedBlockchainOutput;
use crate::error::NonceError;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Per-chain nonce counter for the shared funding key
#[derive(Debug, Default)]
pub struct ConcurrentNonceMap {
    // Signed so that a chain whose pending nonce is 0 can be moved one
    // step back before the first increment.
    nonces: Mutex<HashMap<u64, i128>>,
}

impl ConcurrentNonceMap {
    /// Seed with the pending nonce of every writable EVM chain
    ///
    /// # Errors
    /// Returns `NonceError::Query` if a pending-nonce query fails or is cancelled.
    pub async fn new(
        cancel: &CancellationToken,
        outputs: &[WrappedBlockchainOutput],
    ) -> Result<Self, NonceError> {
        let mut nonces = HashMap::new();

        for output in outputs.iter().filter(|output| !output.read_only) {
            let Some(client) = output.evm() else {
                continue;
            };

            let pending = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(NonceError::Query {
                        chain_id: output.chain_id,
                        reason: "cancelled".to_string(),
                    });
                }
                result = client.pending_nonce(cancel) => result.map_err(|err| NonceError::Query {
                    chain_id: output.chain_id,
                    reason: err.to_string(),
                })?,
            };

            tracing::debug!(chain_id = output.chain_id, pending, "seeded nonce");
            nonces.insert(output.chain_id, i128::from(pending));
        }

        Ok(Self {
            nonces: Mutex::new(nonces),
        })
    }

    /// Build from known values
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self {
            nonces: Mutex::new(
                values
                    .into_iter()
                    .map(|(chain_id, nonce)| (chain_id, i128::from(nonce)))
                    .collect(),
            ),
        }
    }

    /// Advance the counter and return the new value
    ///
    /// # Errors
    /// Returns `NonceError::UnknownChain` for an unseeded chain.
    pub fn increment(&self, chain_id: u64) -> Result<u64, NonceError> {
        let mut nonces = self.nonces.lock();
        let nonce = nonces
            .get_mut(&chain_id)
            .ok_or(NonceError::UnknownChain(chain_id))?;
        let next = *nonce + 1;
        let value = u64::try_from(next).map_err(|_| NonceError::Underflow(chain_id))?;
        *nonce = next;
        Ok(value)
    }

    /// Move the counter one step back
    ///
    /// # Errors
    /// Returns `NonceError::UnknownChain` for an unseeded chain, or
    /// `NonceError::Underflow` if the counter is already before zero.
    pub fn decrement(&self, chain_id: u64) -> Result<(), NonceError> {
        let mut nonces = self.nonces.lock();
        let nonce = nonces
            .get_mut(&chain_id)
            .ok_or(NonceError::UnknownChain(chain_id))?;
        if *nonce < 0 {
            return Err(NonceError::Underflow(chain_id));
        }
        *nonce -= 1;
        Ok(())
    }

    /// Chains being tracked
    #[must_use]
    pub fn chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.nonces.lock().keys().copied().collect();
        chains.sort_unstable();
        chains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClient, ChainEndpoints};
    use crate::error::ProviderError;
    use crate::provider::MockEvmClient;
    use std::sync::Arc;

    fn evm_output(chain_id: u64, read_only: bool, pending: u64) -> WrappedBlockchainOutput {
        let mut client = MockEvmClient::new();
        client.expect_pending_nonce().returning(move |_| Ok(pending));
        client.expect_chain_id().return_const(chain_id);
        WrappedBlockchainOutput {
            chain_id,
            chain_selector: chain_id * 10,
            read_only,
            endpoints: ChainEndpoints::default(),
            client: ChainClient::Evm(Arc::new(client)),
        }
    }

    #[tokio::test]
    async fn seeds_only_writable_chains() {
        let outputs = vec![evm_output(1, false, 7), evm_output(2, true, 3)];
        let map = ConcurrentNonceMap::new(&CancellationToken::new(), &outputs).await.unwrap();

        assert_eq!(map.chains(), vec![1]);
        map.decrement(1).unwrap();
        assert_eq!(map.increment(1).unwrap(), 7);
        assert_eq!(map.increment(1).unwrap(), 8);
        assert_eq!(map.increment(2).unwrap_err(), NonceError::UnknownChain(2));
    }

    #[tokio::test]
    async fn query_failure_is_reported() {
        let mut client = MockEvmClient::new();
        client
            .expect_pending_nonce()
            .returning(|_| Err(ProviderError::failed("rpc", "connection refused")));
        let output = WrappedBlockchainOutput {
            chain_id: 5,
            chain_selector: 50,
            read_only: false,
            endpoints: ChainEndpoints::default(),
            client: ChainClient::Evm(Arc::new(client)),
        };

        let err = ConcurrentNonceMap::new(&CancellationToken::new(), &[output]).await.unwrap_err();
        assert!(matches!(err, NonceError::Query { chain_id: 5, .. }));
    }

    #[test]
    fn zero_pending_nonce_hands_out_zero_first() {
        let map = ConcurrentNonceMap::from_values([(9, 0)]);
        map.decrement(9).unwrap();
        assert_eq!(map.increment(9).unwrap(), 0);
        assert_eq!(map.increment(9).unwrap(), 1);
    }

    #[test]
    fn decrement_below_zero_fails() {
        let map = ConcurrentNonceMap::from_values([(9, 0)]);
        map.decrement(9).unwrap();
        assert_eq!(map.decrement(9).unwrap_err(), NonceError::Underflow(9));
        assert_eq!(map.decrement(1).unwrap_err(), NonceError::UnknownChain(1));
    }

    #[test]
    fn concurrent_increments_are_distinct() {
        let map = Arc::new(ConcurrentNonceMap::from_values([(1, 100)]));
        map.decrement(1).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || map.increment(1).unwrap())
            })
            .collect();
        let mut seen: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (100..116).collect::<Vec<_>>());
    }
}
