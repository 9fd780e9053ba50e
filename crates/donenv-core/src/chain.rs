//! Blockchain descriptors, outputs and deployed contract addresses

use crate::keys::SolanaKeypair;
use crate::provider::{EvmClient, SolanaClient};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Chain family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    /// Ethereum virtual machine chains
    Evm,
    /// Solana
    Solana,
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evm => f.write_str("evm"),
            Self::Solana => f.write_str("solana"),
        }
    }
}

/// Chain to provision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockchainInput {
    /// Chain family
    #[serde(default = "default_family")]
    pub family: ChainFamily,
    /// Numeric chain id
    pub chain_id: u64,
    /// Chain selector (globally unique chain handle)
    pub chain_selector: u64,
    /// Read-only chains are neither funded nor get forwarders
    #[serde(default)]
    pub read_only: bool,
    /// Container image override
    #[serde(default)]
    pub image: Option<String>,
    /// Host port override
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_family() -> ChainFamily {
    ChainFamily::Evm
}

impl BlockchainInput {
    /// Create an EVM chain input
    #[inline]
    #[must_use]
    pub fn evm(chain_id: u64, chain_selector: u64) -> Self {
        Self {
            family: ChainFamily::Evm,
            chain_id,
            chain_selector,
            read_only: false,
            image: None,
            port: None,
        }
    }

    /// Create a Solana chain input
    #[inline]
    #[must_use]
    pub fn solana(chain_id: u64, chain_selector: u64) -> Self {
        Self {
            family: ChainFamily::Solana,
            ..Self::evm(chain_id, chain_selector)
        }
    }

    /// Mark read-only
    #[inline]
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Network endpoints of a running chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEndpoints {
    /// HTTP URL reachable from the host
    pub external_http_url: String,
    /// WS URL reachable from the host
    pub external_ws_url: String,
    /// HTTP URL reachable from node containers
    pub internal_http_url: String,
    /// WS URL reachable from node containers
    pub internal_ws_url: String,
}

/// Family-specific signing client of a chain
#[derive(Clone)]
pub enum ChainClient {
    /// EVM client with the shared funding key
    Evm(Arc<dyn EvmClient>),
    /// Solana client plus the chain-scoped funder keypair
    Solana {
        /// RPC client
        client: Arc<dyn SolanaClient>,
        /// Funding keypair
        funder: Arc<SolanaKeypair>,
    },
}

impl fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evm(_) => f.write_str("ChainClient::Evm"),
            Self::Solana { funder, .. } => f
                .debug_struct("ChainClient::Solana")
                .field("funder", &funder.address())
                .finish(),
        }
    }
}

/// A provisioned chain
#[derive(Debug, Clone)]
pub struct WrappedBlockchainOutput {
    /// Numeric chain id
    pub chain_id: u64,
    /// Chain selector
    pub chain_selector: u64,
    /// Skipped by funding and forwarder deployment
    pub read_only: bool,
    /// Endpoints
    pub endpoints: ChainEndpoints,
    /// Signing client
    pub client: ChainClient,
}

impl WrappedBlockchainOutput {
    /// Chain family, derived from the client
    #[inline]
    #[must_use]
    pub fn family(&self) -> ChainFamily {
        match self.client {
            ChainClient::Evm(_) => ChainFamily::Evm,
            ChainClient::Solana { .. } => ChainFamily::Solana,
        }
    }

    /// EVM client if this is an EVM chain
    #[inline]
    #[must_use]
    pub fn evm(&self) -> Option<&Arc<dyn EvmClient>> {
        match &self.client {
            ChainClient::Evm(client) => Some(client),
            ChainClient::Solana { .. } => None,
        }
    }
}

/// Contracts deployed by the contract stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContractKind {
    /// Capabilities registry (home chain)
    CapabilitiesRegistry,
    /// Keystone forwarder (every writable chain)
    KeystoneForwarder,
    /// Workflow registry (home chain)
    WorkflowRegistry,
    /// OCR3 capability contract (home chain)
    #[serde(rename = "OCR3Capability")]
    Ocr3Capability,
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CapabilitiesRegistry => "CapabilitiesRegistry",
            Self::KeystoneForwarder => "KeystoneForwarder",
            Self::WorkflowRegistry => "WorkflowRegistry",
            Self::Ocr3Capability => "OCR3Capability",
        };
        f.write_str(name)
    }
}

/// Deployed addresses, per chain selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressBook {
    entries: BTreeMap<u64, BTreeMap<ContractKind, String>>,
}

impl AddressBook {
    /// Create an empty book
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an address
    pub fn insert(&mut self, selector: u64, kind: ContractKind, address: impl Into<String>) {
        self.entries
            .entry(selector)
            .or_default()
            .insert(kind, address.into());
    }

    /// Look up an address
    #[must_use]
    pub fn get(&self, selector: u64, kind: ContractKind) -> Option<&str> {
        self.entries
            .get(&selector)
            .and_then(|contracts| contracts.get(&kind))
            .map(String::as_str)
    }

    /// Merge another book in; later entries win
    pub fn merge(&mut self, other: AddressBook) {
        for (selector, contracts) in other.entries {
            self.entries.entry(selector).or_default().extend(contracts);
        }
    }

    /// Number of recorded addresses
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Whether the book is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Solana system program id (all zero bytes)
pub const SYSTEM_PROGRAM_ID: [u8; 32] = [0u8; 32];

const SYSTEM_TRANSFER_TAG: u32 = 2;
const TRANSFER_DATA_LEN: u8 = 12;

/// Unsigned system-program transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTransfer {
    /// Payer public key
    pub from: [u8; 32],
    /// Recipient public key
    pub to: [u8; 32],
    /// Amount in lamports
    pub lamports: u64,
    /// Recent blockhash
    pub recent_blockhash: [u8; 32],
}

impl SystemTransfer {
    /// Legacy message bytes: one signer, the system program as the only
    /// read-only unsigned account, one transfer instruction
    #[must_use]
    pub fn message(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(usize::from(TRANSFER_DATA_LEN));
        data.extend_from_slice(&SYSTEM_TRANSFER_TAG.to_le_bytes());
        data.extend_from_slice(&self.lamports.to_le_bytes());

        let mut message = Vec::with_capacity(3 + 1 + 96 + 32 + 1 + 4 + 1 + data.len());
        message.extend_from_slice(&[1, 0, 1]);
        message.push(3);
        message.extend_from_slice(&self.from);
        message.extend_from_slice(&self.to);
        message.extend_from_slice(&SYSTEM_PROGRAM_ID);
        message.extend_from_slice(&self.recent_blockhash);
        message.push(1);
        message.extend_from_slice(&[2, 2, 0, 1]);
        message.push(TRANSFER_DATA_LEN);
        message.extend_from_slice(&data);
        message
    }

    /// Sign with the payer keypair
    #[must_use]
    pub fn sign(self, payer: &SolanaKeypair) -> SignedTransfer {
        let message = self.message();
        let signature = payer.sign(&message).to_bytes().to_vec();
        SignedTransfer {
            transfer: self,
            message,
            signature,
        }
    }
}

/// Signed transfer, ready to submit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransfer {
    /// What is being transferred
    pub transfer: SystemTransfer,
    /// Signed message bytes
    pub message: Vec<u8>,
    /// Ed25519 signature over the message
    pub signature: Vec<u8>,
}

impl SignedTransfer {
    /// Wire-format transaction
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(1 + self.signature.len() + self.message.len());
        wire.push(1);
        wire.extend_from_slice(&self.signature);
        wire.extend_from_slice(&self.message);
        wire
    }

    /// Base58 signature, the transaction id
    #[must_use]
    pub fn id(&self) -> String {
        bs58::encode(&self.signature).into_string()
    }
}
