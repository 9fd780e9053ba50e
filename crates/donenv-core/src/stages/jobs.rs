//! Job spec generation and job creation through the Job Distributor
//!
//! Factories turn the linked topology into a `DonsToJobSpecs` map. Specs are
//! then proposed per node through the JD and accepted by the node itself.

use super::link_jd::{DonTopology, LinkedNode};
use crate::chain::{AddressBook, ContractKind};
use crate::error::{EnvError, JobError};
use crate::flags::CapabilityFlag;
use crate::operation::{Operation, OperationContext};
use crate::provider::JobDistributor;
use crate::topology::{
    DonMetadata, OcrPeeringData, GATEWAY_INCOMING_PORT, GATEWAY_OUTGOING_PORT, OCR_PEERING_PORT,
};
use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// DON id to JD node id to job specs
pub type DonsToJobSpecs = BTreeMap<u32, BTreeMap<String, Vec<String>>>;

/// Append every spec of `from` to `to`
pub fn merge_job_spec_maps(from: DonsToJobSpecs, to: &mut DonsToJobSpecs) {
    for (don_id, nodes) in from {
        let target = to.entry(don_id).or_default();
        for (node_id, specs) in nodes {
            target.entry(node_id).or_default().extend(specs);
        }
    }
}

/// What factories see
#[derive(Debug, Clone, Copy)]
pub struct JobSpecInput<'a> {
    /// Linked topology
    pub don_topology: &'a DonTopology,
    /// Deployed contracts
    pub addresses: &'a AddressBook,
    /// Registry chain selector
    pub home_chain_selector: u64,
    /// Registry chain id
    pub home_chain_id: u64,
    /// Global OCR peering
    pub ocr_peering: &'a OcrPeeringData,
    /// Extra ports the gateway may call out to
    pub extra_allowed_ports: &'a [u16],
}

/// Produces job specs for some DONs
pub trait JobSpecFactory: Send + Sync {
    /// Name used in errors
    fn name(&self) -> &str;

    /// Generate specs
    ///
    /// # Errors
    /// Any error aborts job creation.
    fn generate(&self, input: &JobSpecInput<'_>) -> Result<DonsToJobSpecs, JobError>;
}

/// Factories used when the caller brings none
#[must_use]
pub fn default_job_spec_factories() -> Vec<Arc<dyn JobSpecFactory>> {
    vec![
        Arc::new(Ocr3JobFactory),
        Arc::new(GatewayJobFactory),
        Arc::new(StandardCapabilityFactory),
    ]
}

fn push_spec(specs: &mut DonsToJobSpecs, don_id: u32, node: &LinkedNode, spec: String) {
    specs
        .entry(don_id)
        .or_default()
        .entry(node.jd_node_id.clone())
        .or_default()
        .push(spec);
}

fn render<T: Serialize>(factory: &str, spec: &T) -> Result<String, JobError> {
    toml::to_string(spec).map_err(|err| JobError::Factory(format!("{factory}: {err}")))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayConfig {
    #[serde(rename = "chainID")]
    chain_id: u64,
    provider_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BootstrapJob {
    #[serde(rename = "type")]
    kind: &'static str,
    schema_version: u32,
    #[serde(rename = "externalJobID")]
    external_job_id: String,
    name: String,
    #[serde(rename = "contractID")]
    contract_id: String,
    contract_config_tracker_poll_interval: &'static str,
    contract_config_confirmations: u32,
    relay: &'static str,
    relay_config: RelayConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OracleJob {
    #[serde(rename = "type")]
    kind: &'static str,
    schema_version: u32,
    #[serde(rename = "externalJobID")]
    external_job_id: String,
    name: String,
    forwarding_allowed: bool,
    max_task_duration: &'static str,
    #[serde(rename = "contractID")]
    contract_id: String,
    relay: &'static str,
    plugin_type: &'static str,
    #[serde(rename = "transmitterID")]
    transmitter_id: String,
    p2pv2_bootstrappers: Vec<String>,
    relay_config: RelayConfig,
    plugin_config: PluginConfig,
}

#[derive(Debug, Serialize)]
struct PluginConfig {
    command: &'static str,
}

/// OCR3 bootstrap and oracle jobs for DONs with the `ocr3` capability
#[derive(Debug, Clone, Copy, Default)]
pub struct Ocr3JobFactory;

impl JobSpecFactory for Ocr3JobFactory {
    fn name(&self) -> &str {
        "ocr3"
    }

    fn generate(&self, input: &JobSpecInput<'_>) -> Result<DonsToJobSpecs, JobError> {
        let mut specs = DonsToJobSpecs::new();
        let dons = input.don_topology.dons().filter(|(don, _)| don.has(CapabilityFlag::Ocr3));

        for (don, nodes) in dons {
            let contract = input
                .addresses
                .get(input.home_chain_selector, ContractKind::Ocr3Capability)
                .ok_or_else(|| JobError::Factory(format!("{}: OCR3 capability contract not deployed", self.name())))?;

            let mut bootstrapper = input.ocr_peering.locator();
            if let Some(bootstrap) = nodes.iter().find(|node| node.metadata.is_bootstrap()) {
                let peer_id = bootstrap.metadata.p2p_peer_id.as_ref().ok_or_else(|| {
                    JobError::Factory(format!("{}: bootstrap of {} has no peer id", self.name(), don.name))
                })?;
                bootstrapper = format!("{}@{}:{OCR_PEERING_PORT}", peer_id.raw(), bootstrap.metadata.host);

                let job = BootstrapJob {
                    kind: "bootstrap",
                    schema_version: 1,
                    external_job_id: Uuid::new_v4().to_string(),
                    name: "ocr3-bootstrap".to_string(),
                    contract_id: contract.to_string(),
                    contract_config_tracker_poll_interval: "1s",
                    contract_config_confirmations: 1,
                    relay: "evm",
                    relay_config: RelayConfig {
                        chain_id: input.home_chain_id,
                        provider_type: "ocr3-capability",
                    },
                };
                push_spec(&mut specs, don.id, bootstrap, render(self.name(), &job)?);
            }

            for node in nodes.iter().filter(|node| !node.metadata.is_bootstrap()) {
                let transmitter = node.metadata.address(input.home_chain_id).ok_or_else(|| {
                    JobError::Factory(format!(
                        "{}: node {} has no address on chain {}",
                        self.name(),
                        node.metadata.name(),
                        input.home_chain_id
                    ))
                })?;
                let job = OracleJob {
                    kind: "offchainreporting2",
                    schema_version: 1,
                    external_job_id: Uuid::new_v4().to_string(),
                    name: "ocr3-oracle".to_string(),
                    forwarding_allowed: false,
                    max_task_duration: "0s",
                    contract_id: contract.to_string(),
                    relay: "evm",
                    plugin_type: "plugin",
                    transmitter_id: transmitter.to_string(),
                    p2pv2_bootstrappers: vec![bootstrapper.clone()],
                    relay_config: RelayConfig {
                        chain_id: input.home_chain_id,
                        provider_type: "ocr3-capability",
                    },
                    plugin_config: PluginConfig {
                        command: "chainlink-ocr3-capability",
                    },
                };
                push_spec(&mut specs, don.id, node, render(self.name(), &job)?);
            }
        }

        Ok(specs)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewayJob {
    #[serde(rename = "type")]
    kind: &'static str,
    schema_version: u32,
    #[serde(rename = "externalJobID")]
    external_job_id: String,
    name: &'static str,
    forwarding_allowed: bool,
    gateway_config: GatewayConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GatewayConfig {
    connection_manager_config: ConnectionManagerConfig,
    dons: Vec<GatewayDon>,
    node_server_config: ServerConfig,
    user_server_config: ServerConfig,
    #[serde(rename = "HTTPClientConfig")]
    http_client_config: HttpClientConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ConnectionManagerConfig {
    auth_challenge_len: u32,
    auth_gateway_id: &'static str,
    auth_timestamp_tolerance_sec: u32,
    heartbeat_interval_sec: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GatewayDon {
    don_id: String,
    #[serde(rename = "F")]
    f: u32,
    handler_name: &'static str,
    members: Vec<GatewayMember>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct GatewayMember {
    address: String,
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServerConfig {
    path: String,
    port: u16,
    max_request_bytes: u32,
    read_timeout_millis: u32,
    request_timeout_millis: u32,
    write_timeout_millis: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HttpClientConfig {
    max_response_bytes: u32,
    allowed_ports: Vec<u16>,
}

/// Gateway job on the gateway node, listing every worker that dials it
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayJobFactory;

impl GatewayJobFactory {
    fn dons(input: &JobSpecInput<'_>) -> Result<Vec<GatewayDon>, JobError> {
        let topology = &input.don_topology.topology;
        topology
            .dons
            .iter()
            .filter(|don| don.flags.iter().any(CapabilityFlag::needs_gateway))
            .map(|don| {
                let members = don
                    .workers()
                    .map(|node| {
                        node.address(input.home_chain_id)
                            .map(|address| GatewayMember {
                                address: address.to_string(),
                                name: node.name(),
                            })
                            .ok_or_else(|| {
                                JobError::Factory(format!(
                                    "gateway: node {} has no address on chain {}",
                                    node.name(),
                                    input.home_chain_id
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(GatewayDon {
                    don_id: don.name.clone(),
                    f: fault_tolerance(don),
                    handler_name: "web-api-capabilities",
                    members,
                })
            })
            .collect()
    }
}

pub(crate) fn fault_tolerance(don: &DonMetadata) -> u32 {
    let workers = u32::try_from(don.workers().count()).unwrap_or(u32::MAX);
    (workers.saturating_sub(1) / 3).max(1)
}

impl JobSpecFactory for GatewayJobFactory {
    fn name(&self) -> &str {
        "gateway"
    }

    fn generate(&self, input: &JobSpecInput<'_>) -> Result<DonsToJobSpecs, JobError> {
        let mut specs = DonsToJobSpecs::new();

        for (don, nodes) in input.don_topology.dons().filter(|(don, _)| don.has(CapabilityFlag::Gateway)) {
            let Some(gateway) = nodes.iter().find(|node| node.metadata.is_gateway) else {
                return Err(JobError::Factory(format!("gateway: DON {} has no gateway node", don.name)));
            };

            let mut allowed_ports = vec![80, 443];
            allowed_ports.extend_from_slice(input.extra_allowed_ports);
            let job = GatewayJob {
                kind: "gateway",
                schema_version: 1,
                external_job_id: Uuid::new_v4().to_string(),
                name: "Gateway",
                forwarding_allowed: false,
                gateway_config: GatewayConfig {
                    connection_manager_config: ConnectionManagerConfig {
                        auth_challenge_len: 10,
                        auth_gateway_id: "gateway0",
                        auth_timestamp_tolerance_sec: 5,
                        heartbeat_interval_sec: 20,
                    },
                    dons: Self::dons(input)?,
                    node_server_config: ServerConfig {
                        path: "/node".to_string(),
                        port: GATEWAY_OUTGOING_PORT,
                        max_request_bytes: 100_000,
                        read_timeout_millis: 1000,
                        request_timeout_millis: 10_000,
                        write_timeout_millis: 1000,
                    },
                    user_server_config: ServerConfig {
                        path: "/".to_string(),
                        port: GATEWAY_INCOMING_PORT,
                        max_request_bytes: 100_000,
                        read_timeout_millis: 1000,
                        request_timeout_millis: 10_000,
                        write_timeout_millis: 1000,
                    },
                    http_client_config: HttpClientConfig {
                        max_response_bytes: 100_000_000,
                        allowed_ports,
                    },
                },
            };
            push_spec(&mut specs, don.id, gateway, render(self.name(), &job)?);
        }

        Ok(specs)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StandardCapabilityJob {
    #[serde(rename = "type")]
    kind: &'static str,
    schema_version: u32,
    #[serde(rename = "externalJobID")]
    external_job_id: String,
    name: String,
    forwarding_allowed: bool,
    command: String,
    config: String,
}

/// Capability jobs hosted by a binary on every worker
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardCapabilityFactory;

impl StandardCapabilityFactory {
    /// Job name, command and config of a flag on a chain
    #[must_use]
    pub fn job_for(flag: CapabilityFlag, chain_id: u64) -> Option<(String, &'static str, String)> {
        match flag {
            CapabilityFlag::Cron => Some(("cron-capabilities".into(), "cron", String::new())),
            CapabilityFlag::CustomCompute => Some((
                "custom-compute".into(),
                "__builtin_custom-compute-action",
                "NumWorkers = 3\n[rateLimiter]\nglobalRPS = 20.0\nglobalBurst = 30\nperSenderRPS = 1.0\nperSenderBurst = 5\n"
                    .into(),
            )),
            CapabilityFlag::WebApiTrigger => Some((
                "web-api-trigger".into(),
                "__builtin_web-api-trigger",
                String::new(),
            )),
            CapabilityFlag::WebApiTarget => Some((
                "web-api-target".into(),
                "__builtin_web-api-target",
                String::new(),
            )),
            CapabilityFlag::LogTrigger => Some((
                format!("log-event-trigger-{chain_id}"),
                "log-event-trigger",
                format!("chainId = \"{chain_id}\"\nnetwork = \"evm\"\nlookbackBlocks = 1000\npollPeriod = 1000\n"),
            )),
            CapabilityFlag::ReadContract => Some((
                format!("read-contract-{chain_id}"),
                "readcontract",
                format!("chainId = \"{chain_id}\"\nnetwork = \"evm\"\n"),
            )),
            CapabilityFlag::Vault => Some(("vault-capability".into(), "__builtin_vault", String::new())),
            CapabilityFlag::HttpTrigger => Some(("http-trigger".into(), "http_trigger", String::new())),
            CapabilityFlag::HttpAction => Some(("http-action".into(), "http_action", String::new())),
            CapabilityFlag::Workflow
            | CapabilityFlag::Gateway
            | CapabilityFlag::Capabilities
            | CapabilityFlag::Ocr3
            | CapabilityFlag::WriteEvm
            | CapabilityFlag::WriteSolana => None,
        }
    }
}

impl JobSpecFactory for StandardCapabilityFactory {
    fn name(&self) -> &str {
        "standard-capability"
    }

    fn generate(&self, input: &JobSpecInput<'_>) -> Result<DonsToJobSpecs, JobError> {
        let mut specs = DonsToJobSpecs::new();

        for (don, nodes) in input.don_topology.dons() {
            for flag in don.flags.iter() {
                let Some((name, command, config)) = Self::job_for(flag, input.home_chain_id) else {
                    continue;
                };
                for node in nodes.iter().filter(|node| !node.metadata.is_bootstrap()) {
                    let job = StandardCapabilityJob {
                        kind: "standardcapabilities",
                        schema_version: 1,
                        external_job_id: Uuid::new_v4().to_string(),
                        name: name.clone(),
                        forwarding_allowed: false,
                        command: command.to_string(),
                        config: config.clone(),
                    };
                    push_spec(&mut specs, don.id, node, render(self.name(), &job)?);
                }
            }
        }

        Ok(specs)
    }
}

/// Validated job creation request
#[derive(Debug, Clone)]
pub struct CreateJobsInput<'a> {
    /// Linked topology
    pub don_topology: &'a DonTopology,
    /// Specs to create
    pub specs: &'a DonsToJobSpecs,
}

impl CreateJobsInput<'_> {
    /// Require a non-empty topology and at least one spec
    ///
    /// # Errors
    /// Returns `JobError::InvalidInput`.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.don_topology.topology.dons.is_empty() {
            return Err(JobError::InvalidInput("topology has no DONs".to_string()));
        }
        if self.specs.values().flat_map(BTreeMap::values).all(Vec::is_empty) {
            return Err(JobError::InvalidInput("no job specs to create".to_string()));
        }
        Ok(())
    }
}

/// Propose every spec through the JD and accept it on the node
///
/// # Errors
/// Fails on invalid input, unknown node ids, or the first failed proposal
/// or acceptance.
pub async fn create_jobs(jd: &dyn JobDistributor, input: &CreateJobsInput<'_>) -> Result<(), JobError> {
    input.validate()?;

    for (don, nodes) in input.don_topology.dons() {
        let Some(don_specs) = input.specs.get(&don.id) else {
            tracing::warn!(don = %don.name, "no job specs found for DON");
            continue;
        };

        let per_node = don_specs.iter().map(|(node_id, specs)| async move {
            let node = nodes
                .iter()
                .find(|node| &node.jd_node_id == node_id)
                .ok_or_else(|| JobError::NotLinked(node_id.clone()))?;
            for spec in specs {
                let create = |source| JobError::Create {
                    node: node.started.name.clone(),
                    source,
                };
                let proposal = jd.propose_job(node_id, spec).await.map_err(create)?;
                node.started.api.accept_job(&proposal).await.map_err(create)?;
            }
            Ok::<_, JobError>(specs.len())
        });
        let created: usize = try_join_all(per_node).await?.into_iter().sum();
        tracing::info!(don = %don.name, jobs = created, "created jobs");
    }

    Ok(())
}

/// Generates job specs and creates them on every node
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateJobs;

/// Input of `CreateJobs`
#[derive(Clone)]
pub struct CreateJobsStageInput {
    /// Spec factories, in order
    pub factories: Vec<Arc<dyn JobSpecFactory>>,
    /// Registry chain selector
    pub home_chain_selector: u64,
    /// Registry chain id
    pub home_chain_id: u64,
    /// Extra ports the gateway may call out to
    pub extra_allowed_ports: Vec<u16>,
}

impl std::fmt::Debug for CreateJobsStageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.factories.iter().map(|factory| factory.name()).collect();
        f.debug_struct("CreateJobsStageInput")
            .field("factories", &names)
            .field("home_chain_selector", &self.home_chain_selector)
            .field("home_chain_id", &self.home_chain_id)
            .field("extra_allowed_ports", &self.extra_allowed_ports)
            .finish()
    }
}

/// Outputs of earlier stages needed by `CreateJobs`
#[derive(Clone)]
pub struct CreateJobsDeps {
    /// Linked topology
    pub don_topology: DonTopology,
    /// Deployed contracts
    pub addresses: AddressBook,
    /// Global OCR peering
    pub ocr_peering: OcrPeeringData,
    /// JD client
    pub jd: Arc<dyn JobDistributor>,
}

#[async_trait]
impl Operation for CreateJobs {
    const NAME: &'static str = "create-jobs";
    const VERSION: &'static str = "1.0.0";
    type Input = CreateJobsStageInput;
    type Deps = CreateJobsDeps;
    type Output = DonsToJobSpecs;

    async fn execute(
        &self,
        _ctx: &OperationContext,
        deps: &CreateJobsDeps,
        input: CreateJobsStageInput,
    ) -> Result<DonsToJobSpecs, EnvError> {
        let spec_input = JobSpecInput {
            don_topology: &deps.don_topology,
            addresses: &deps.addresses,
            home_chain_selector: input.home_chain_selector,
            home_chain_id: input.home_chain_id,
            ocr_peering: &deps.ocr_peering,
            extra_allowed_ports: &input.extra_allowed_ports,
        };

        let mut specs = DonsToJobSpecs::new();
        for factory in &input.factories {
            merge_job_spec_maps(factory.generate(&spec_input)?, &mut specs);
        }

        create_jobs(
            deps.jd.as_ref(),
            &CreateJobsInput {
                don_topology: &deps.don_topology,
                specs: &specs,
            },
        )
        .await?;

        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::InfraInput;
    use crate::keys::PeerId;
    use crate::provider::{JobProposal, MockJobDistributor, MockNodeApi, StartedNode};
    use crate::topology::{build_topology, NodeSetInput, Topology};

    fn don_topology(sets: &[NodeSetInput], accept: bool) -> DonTopology {
        let mut topology: Topology = build_topology(sets, &InfraInput::Docker, 10).unwrap();
        for don in &mut topology.dons {
            for node in &mut don.nodes {
                node.p2p_peer_id = Some(PeerId::from_public_key(&[node.index as u8; 32]));
                node.addresses.insert(1337, format!("0x{}{}", don.id, node.index));
            }
        }

        let nodes = topology
            .dons
            .iter()
            .map(|don| {
                let linked = don
                    .nodes
                    .iter()
                    .map(|metadata| {
                        let mut api = MockNodeApi::new();
                        if accept {
                            api.expect_accept_job().returning(|_| Ok(()));
                        }
                        LinkedNode {
                            metadata: metadata.clone(),
                            started: StartedNode {
                                name: metadata.name(),
                                host: metadata.host.clone(),
                                external_url: String::new(),
                                api: Arc::new(api),
                            },
                            jd_node_id: format!("jd-{}", metadata.name()),
                        }
                    })
                    .collect();
                (don.id, linked)
            })
            .collect();

        DonTopology {
            topology: Arc::new(topology),
            nodes,
        }
    }

    fn addresses() -> AddressBook {
        let mut book = AddressBook::new();
        book.insert(10, ContractKind::Ocr3Capability, "0xocr3");
        book
    }

    fn ocr_peering() -> OcrPeeringData {
        OcrPeeringData {
            ocr_bootstrapper_peer_id: PeerId::from_public_key(&[9; 32]),
            ocr_bootstrapper_host: "workflow-node0".into(),
            port: OCR_PEERING_PORT,
        }
    }

    fn workflow_set() -> NodeSetInput {
        NodeSetInput::new("workflow", 4)
            .with_don_types([CapabilityFlag::Workflow, CapabilityFlag::Gateway])
            .with_capabilities([CapabilityFlag::Ocr3, CapabilityFlag::Cron])
    }

    #[test]
    fn merge_appends_without_dropping() {
        let mut to = DonsToJobSpecs::from([(1, BTreeMap::from([("a".to_string(), vec!["x".to_string()])]))]);
        let from = DonsToJobSpecs::from([
            (1, BTreeMap::from([("a".to_string(), vec!["y".to_string()])])),
            (2, BTreeMap::from([("b".to_string(), vec!["z".to_string()])])),
        ]);
        merge_job_spec_maps(from, &mut to);
        assert_eq!(to[&1]["a"], vec!["x", "y"]);
        assert_eq!(to[&2]["b"], vec!["z"]);
    }

    #[test]
    fn ocr3_factory_creates_bootstrap_and_oracles() {
        let topology = don_topology(&[workflow_set()], false);
        let book = addresses();
        let peering = ocr_peering();
        let input = JobSpecInput {
            don_topology: &topology,
            addresses: &book,
            home_chain_selector: 10,
            home_chain_id: 1337,
            ocr_peering: &peering,
            extra_allowed_ports: &[],
        };

        let specs = Ocr3JobFactory.generate(&input).unwrap();
        let don = &specs[&1];
        assert_eq!(don.len(), 4);
        assert!(don["jd-workflow-node0"][0].contains("type = \"bootstrap\""));
        let oracle = &don["jd-workflow-node2"][0];
        assert!(oracle.contains("type = \"offchainreporting2\""));
        assert!(oracle.contains("transmitterID = \"0x12\""));
        assert!(oracle.contains("@workflow-node0:5001"));
    }

    #[test]
    fn gateway_factory_lists_workflow_workers() {
        let topology = don_topology(&[workflow_set()], false);
        let book = addresses();
        let peering = ocr_peering();
        let input = JobSpecInput {
            don_topology: &topology,
            addresses: &book,
            home_chain_selector: 10,
            home_chain_id: 1337,
            ocr_peering: &peering,
            extra_allowed_ports: &[8080],
        };

        let specs = GatewayJobFactory.generate(&input).unwrap();
        let gateway = &specs[&1]["jd-workflow-node0"][0];
        let parsed: toml::Value = toml::from_str(gateway).unwrap();
        let config = &parsed["gatewayConfig"];
        let members = config["Dons"][0]["Members"].as_array().unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(config["Dons"][0]["F"].as_integer(), Some(1));
        assert_eq!(config["NodeServerConfig"]["Port"].as_integer(), Some(5003));
        assert_eq!(
            config["HTTPClientConfig"]["AllowedPorts"].as_array().unwrap().len(),
            3
        );
    }

    #[test]
    fn standard_factory_skips_bootstrap() {
        let topology = don_topology(&[workflow_set()], false);
        let book = addresses();
        let peering = ocr_peering();
        let input = JobSpecInput {
            don_topology: &topology,
            addresses: &book,
            home_chain_selector: 10,
            home_chain_id: 1337,
            ocr_peering: &peering,
            extra_allowed_ports: &[],
        };

        let specs = StandardCapabilityFactory.generate(&input).unwrap();
        assert!(!specs[&1].contains_key("jd-workflow-node0"));
        assert!(specs[&1]["jd-workflow-node1"][0].contains("command = \"cron\""));
    }

    #[test]
    fn don_types_have_no_standard_job() {
        for flag in CapabilityFlag::ALL.into_iter().filter(|flag| flag.is_don_type()) {
            assert!(StandardCapabilityFactory::job_for(flag, 1).is_none());
        }
    }

    #[test]
    fn empty_specs_are_rejected() {
        let topology = don_topology(&[workflow_set()], false);
        let specs = DonsToJobSpecs::new();
        let err = CreateJobsInput {
            don_topology: &topology,
            specs: &specs,
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("no job specs"));
    }

    #[tokio::test]
    async fn proposes_and_accepts_every_spec() {
        let topology = don_topology(&[workflow_set()], true);
        let mut jd = MockJobDistributor::new();
        jd.expect_propose_job().times(2).returning(|node_id, spec| {
            Ok(JobProposal {
                id: format!("proposal-{node_id}"),
                node_id: node_id.to_string(),
                spec: spec.to_string(),
            })
        });

        let specs = DonsToJobSpecs::from([(
            1,
            BTreeMap::from([("jd-workflow-node1".to_string(), vec!["a".to_string(), "b".to_string()])]),
        )]);
        create_jobs(
            &jd,
            &CreateJobsInput {
                don_topology: &topology,
                specs: &specs,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unknown_node_id_fails() {
        let topology = don_topology(&[workflow_set()], false);
        let jd = MockJobDistributor::new();
        let specs = DonsToJobSpecs::from([(1, BTreeMap::from([("ghost".to_string(), vec!["a".to_string()])]))]);
        let err = create_jobs(
            &jd,
            &CreateJobsInput {
                don_topology: &topology,
                specs: &specs,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, JobError::NotLinked(id) if id == "ghost"));
    }
}
