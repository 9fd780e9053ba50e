//! Capability and DON-type flags
//!
//! Flags form a closed set. DON types (`workflow`, `gateway`, `capabilities`)
//! decide the shape of a DON; the remaining variants are capabilities hosted
//! by its nodes. Unknown strings are rejected at parse time.

use crate::error::TopologyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A DON type or capability tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CapabilityFlag {
    /// DON runs user workflows
    Workflow,
    /// DON hosts the HTTP gateway
    Gateway,
    /// DON hosts remote capabilities
    Capabilities,
    /// OCR3 consensus
    Ocr3,
    /// Cron trigger
    Cron,
    /// Custom compute
    CustomCompute,
    /// Web API trigger
    WebApiTrigger,
    /// Web API target
    WebApiTarget,
    /// EVM chain writer
    WriteEvm,
    /// Solana chain writer
    WriteSolana,
    /// Log event trigger
    LogTrigger,
    /// Contract reader
    ReadContract,
    /// Vault DON capability
    Vault,
    /// HTTP trigger
    HttpTrigger,
    /// HTTP action
    HttpAction,
}

impl CapabilityFlag {
    /// All flags, in declaration order
    pub const ALL: [CapabilityFlag; 15] = [
        Self::Workflow,
        Self::Gateway,
        Self::Capabilities,
        Self::Ocr3,
        Self::Cron,
        Self::CustomCompute,
        Self::WebApiTrigger,
        Self::WebApiTarget,
        Self::WriteEvm,
        Self::WriteSolana,
        Self::LogTrigger,
        Self::ReadContract,
        Self::Vault,
        Self::HttpTrigger,
        Self::HttpAction,
    ];

    /// Canonical string form
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Gateway => "gateway",
            Self::Capabilities => "capabilities",
            Self::Ocr3 => "ocr3",
            Self::Cron => "cron",
            Self::CustomCompute => "custom-compute",
            Self::WebApiTrigger => "web-api-trigger",
            Self::WebApiTarget => "web-api-target",
            Self::WriteEvm => "write-evm",
            Self::WriteSolana => "write-solana",
            Self::LogTrigger => "log-event-trigger",
            Self::ReadContract => "read-contract",
            Self::Vault => "vault",
            Self::HttpTrigger => "http-trigger",
            Self::HttpAction => "http-action",
        }
    }

    /// Whether the flag describes the DON type rather than a capability
    #[inline]
    #[must_use]
    pub fn is_don_type(self) -> bool {
        matches!(self, Self::Workflow | Self::Gateway | Self::Capabilities)
    }

    /// Whether workers carrying the flag connect to the gateway
    #[must_use]
    pub fn needs_gateway(self) -> bool {
        match self {
            Self::Workflow
            | Self::CustomCompute
            | Self::WebApiTrigger
            | Self::WebApiTarget
            | Self::Vault
            | Self::HttpTrigger
            | Self::HttpAction => true,
            Self::Gateway
            | Self::Capabilities
            | Self::Ocr3
            | Self::Cron
            | Self::WriteEvm
            | Self::WriteSolana
            | Self::LogTrigger
            | Self::ReadContract => false,
        }
    }
}

impl fmt::Display for CapabilityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityFlag {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|flag| flag.as_str() == s)
            .ok_or_else(|| TopologyError::UnknownFlag(s.to_string()))
    }
}

impl TryFrom<String> for CapabilityFlag {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CapabilityFlag> for String {
    fn from(flag: CapabilityFlag) -> Self {
        flag.as_str().to_string()
    }
}

/// Ordered set of flags attached to a DON
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlagSet(BTreeSet<CapabilityFlag>);

impl FlagSet {
    /// Create an empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check membership
    #[inline]
    #[must_use]
    pub fn has(&self, flag: CapabilityFlag) -> bool {
        self.0.contains(&flag)
    }

    /// Insert a flag
    #[inline]
    pub fn insert(&mut self, flag: CapabilityFlag) -> bool {
        self.0.insert(flag)
    }

    /// Builder-style insert
    #[inline]
    #[must_use]
    pub fn with(mut self, flag: CapabilityFlag) -> Self {
        self.0.insert(flag);
        self
    }

    /// Iterate in canonical order
    pub fn iter(&self) -> impl Iterator<Item = CapabilityFlag> + '_ {
        self.0.iter().copied()
    }

    /// Number of flags
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// DON hosts only the gateway, no workflow or capabilities role
    #[must_use]
    pub fn is_gateway_only(&self) -> bool {
        self.has(CapabilityFlag::Gateway)
            && !self.has(CapabilityFlag::Workflow)
            && !self.has(CapabilityFlag::Capabilities)
    }

    /// Parse a list of flag strings
    ///
    /// # Errors
    /// Returns `TopologyError::UnknownFlag` for the first unrecognized string.
    pub fn parse<S: AsRef<str>>(values: &[S]) -> Result<Self, TopologyError> {
        values
            .iter()
            .map(|value| value.as_ref().parse())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }
}

impl FromIterator<CapabilityFlag> for FlagSet {
    fn from_iter<I: IntoIterator<Item = CapabilityFlag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<CapabilityFlag> for FlagSet {
    fn extend<I: IntoIterator<Item = CapabilityFlag>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|flag| flag.as_str()).collect();
        f.write_str(&names.join(", "))
    }
}
