//! CRIB infra variant
//!
//! Provides:
//! - `CribSession`, a devspace session inside `nix develop` rooted at the
//!   CRIB project folder
//! - Chain, Job Distributor and DON deployment through devspace steps
//! - Override files and JSON output files exchanged through the configs
//!   directory
//! - `CribProvisioner`, which plugs the session into the pipeline's
//!   collaborator traits

use crate::chain::{BlockchainInput, ChainEndpoints, ChainFamily, WrappedBlockchainOutput};
use crate::error::{CribError, ProviderError, ShellError};
use crate::infra::{CribInput, NodeRole};
use crate::provider::{
    BlockchainProvisioner, JdInput, JdOutput, JobDistributor, JobDistributorLauncher, NodeApi, NodeSetLauncher,
    NodeSetOutput, NodeSetSpec, StartedNode,
};
use crate::shell::{ShellCommand, ShellRunner};
use crate::topology::NodeSetInput;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEPLOY_CHAIN: &str = "deploy-geth-chain";
const DEPLOY_JD: &str = "deploy-jd";
const DEPLOY_DON: &str = "deploy-don";

/// Job Distributor endpoints written by `deploy-jd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CribJdOutput {
    /// gRPC URL reachable from the test process
    pub external_grpc_url: String,
    /// WSRPC URL reachable from nodes
    pub internal_wsrpc_url: String,
}

/// One node written by `deploy-don`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CribNodeOutput {
    /// Pod name
    pub name: String,
    /// Host reachable from other pods
    pub internal_host: String,
    /// URL reachable from the test process
    pub external_url: String,
}

/// Split `repo:tag` at the last colon
///
/// # Errors
/// Returns `CribError::UntaggedImage` when there is no tag.
pub fn split_image_tag(image: &str) -> Result<(&str, &str), CribError> {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.is_empty() && !tag.contains('/') => Ok((repo, tag)),
        _ => Err(CribError::UntaggedImage(image.to_string())),
    }
}

/// The one tagged image every node of a set shares
///
/// # Errors
/// Fails when nodes use different images or the image has no tag.
pub fn node_set_image<'a, I>(images: I) -> Result<&'a str, CribError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut distinct: Vec<&str> = Vec::new();
    for image in images {
        if !distinct.contains(&image) {
            distinct.push(image);
        }
    }
    match distinct.as_slice() {
        [image] => {
            split_image_tag(image)?;
            Ok(image)
        }
        other => Err(CribError::MixedImages(other.len())),
    }
}

/// Check image rules for a declared node set before anything is deployed
///
/// # Errors
/// Same as [`node_set_image`].
pub fn validate_node_set_images(set: &NodeSetInput) -> Result<(), CribError> {
    node_set_image(set.nodes.iter().map(|node| node.image.as_str())).map(|_| ())
}

/// Override file name of a node
#[must_use]
pub fn override_file_name(kind: &str, role: NodeRole, position: usize) -> String {
    match role {
        NodeRole::Bootstrap => format!("{kind}-override-bt-{position}.toml"),
        NodeRole::Worker => format!("{kind}-override-{position}.toml"),
    }
}

fn normalize_toml(index: usize, text: &str) -> Result<String, CribError> {
    let value: toml::Value = toml::from_str(text).map_err(|err| CribError::InvalidOverride {
        index,
        reason: err.to_string(),
    })?;
    toml::to_string(&value).map_err(|err| CribError::InvalidOverride {
        index,
        reason: err.to_string(),
    })
}

async fn write_file(path: &Path, contents: &str) -> Result<(), CribError> {
    tokio::fs::write(path, contents).await.map_err(|source| CribError::Io {
        path: path.display().to_string(),
        source,
    })
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CribError> {
    let text = tokio::fs::read_to_string(path).await.map_err(|source| CribError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| CribError::Output {
        path: path.display().to_string(),
        source,
    })
}

/// A devspace session for one CRIB namespace
#[derive(Clone)]
pub struct CribSession {
    shell: Arc<dyn ShellRunner>,
    env: BTreeMap<String, String>,
    configs_dir: PathBuf,
}

impl std::fmt::Debug for CribSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CribSession")
            .field("env", &self.env)
            .field("configs_dir", &self.configs_dir)
            .finish_non_exhaustive()
    }
}

impl CribSession {
    /// Environment shared by every devspace step
    ///
    /// # Errors
    /// Returns `CribError::MissingTeam` for the `aws` provider without team tags.
    pub fn global_env(
        crib: &CribInput,
        configs_dir: &Path,
        extra: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, CribError> {
        let mut env = BTreeMap::from([
            ("PROVIDER".to_string(), crib.provider.clone()),
            ("DEVSPACE_NAMESPACE".to_string(), crib.namespace.clone()),
        ]);
        env.extend(extra.iter().map(|(key, value)| (key.clone(), value.clone())));

        if crib.provider == "aws" {
            let team = crib
                .team
                .as_ref()
                .ok_or_else(|| CribError::MissingTeam(crib.provider.clone()))?;
            env.insert("CHAINLINK_TEAM".to_string(), team.team.clone());
            env.insert("CHAINLINK_PRODUCT".to_string(), team.product.clone());
            env.insert("CHAINLINK_COST_CENTER".to_string(), team.cost_center.clone());
            env.insert("CHAINLINK_COMPONENT".to_string(), team.component.clone());
        }

        env.insert("CRE_CONFIG_DIR".to_string(), configs_dir.display().to_string());
        Ok(env)
    }

    /// Open a session and purge whatever the namespace still runs
    ///
    /// # Errors
    /// Fails on invalid settings or when `devspace purge` fails.
    pub async fn start(
        crib: &CribInput,
        extra_env: &BTreeMap<String, String>,
        shell: Arc<dyn ShellRunner>,
        cancel: &CancellationToken,
    ) -> Result<Self, CribError> {
        let configs_dir = if crib.configs_dir.is_absolute() {
            crib.configs_dir.clone()
        } else {
            std::env::current_dir()
                .map_err(|source| CribError::Io {
                    path: crib.configs_dir.display().to_string(),
                    source,
                })?
                .join(&crib.configs_dir)
        };
        tokio::fs::create_dir_all(&configs_dir).await.map_err(|source| CribError::Io {
            path: configs_dir.display().to_string(),
            source,
        })?;

        let session = Self {
            shell,
            env: Self::global_env(crib, &configs_dir, extra_env)?,
            configs_dir,
        };

        let purge = session.command(["purge"], BTreeMap::new());
        session
            .shell
            .run(&purge, cancel)
            .await
            .map_err(|source| CribError::Step { step: "devspace purge", source })?;
        tracing::info!(namespace = %crib.namespace, "crib session ready");
        Ok(session)
    }

    /// Directory shared with devspace
    #[must_use]
    pub fn configs_dir(&self) -> &Path {
        &self.configs_dir
    }

    fn command<const N: usize>(&self, args: [&str; N], env: BTreeMap<String, String>) -> ShellCommand {
        let mut command = ShellCommand::new("devspace").args(args);
        command.env.extend(self.env.clone());
        command.env.extend(env);
        command
    }

    async fn run_step(
        &self,
        step: &'static str,
        env: BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), CribError> {
        let command = self.command(["run", step], env);
        tracing::info!(step, "running devspace step");
        self.shell
            .run(&command, cancel)
            .await
            .map(|_| ())
            .map_err(|source: ShellError| CribError::Step { step, source })
    }

    /// Deploy a geth chain and read back its endpoints
    ///
    /// # Errors
    /// Fails for non-EVM chains, on devspace failure or unreadable output.
    pub async fn deploy_blockchain(
        &self,
        input: &BlockchainInput,
        cancel: &CancellationToken,
    ) -> Result<ChainEndpoints, CribError> {
        if input.family != ChainFamily::Evm {
            return Err(CribError::UnsupportedFamily(input.family.to_string()));
        }

        let env = BTreeMap::from([("CHAIN_ID".to_string(), input.chain_id.to_string())]);
        self.run_step(DEPLOY_CHAIN, env, cancel).await?;

        read_json(
            &self
                .configs_dir
                .join(format!("blockchain-{}-{}.json", input.family, input.chain_id)),
        )
        .await
    }

    /// Deploy the Job Distributor and read back its endpoints
    ///
    /// # Errors
    /// Fails for an untagged image, on devspace failure or unreadable output.
    pub async fn deploy_jd(&self, input: &JdInput, cancel: &CancellationToken) -> Result<CribJdOutput, CribError> {
        let (_, tag) = split_image_tag(&input.image)?;
        let env = BTreeMap::from([("JOB_DISTRIBUTOR_IMAGE_TAG".to_string(), tag.to_string())]);
        self.run_step(DEPLOY_JD, env, cancel).await?;

        read_json(&self.configs_dir.join("jd.json")).await
    }

    /// Write every node's overrides, deploy the DON and read back its nodes
    ///
    /// # Errors
    /// Fails on image rules, invalid overrides, devspace failure or
    /// unreadable output.
    pub async fn deploy_don(
        &self,
        spec: &NodeSetSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<CribNodeOutput>, CribError> {
        let image = node_set_image(spec.nodes.iter().map(|node| node.image.as_str()))?;
        let (repo, tag) = split_image_tag(image)?;

        let don_dir = self.configs_dir.join(&spec.name);
        tokio::fs::create_dir_all(&don_dir).await.map_err(|source| CribError::Io {
            path: don_dir.display().to_string(),
            source,
        })?;

        let mut bootstraps = 0usize;
        let mut workers = 0usize;
        for node in &spec.nodes {
            let counter = match node.role {
                NodeRole::Bootstrap => &mut bootstraps,
                NodeRole::Worker => &mut workers,
            };
            let position = *counter;
            *counter += 1;

            let config = normalize_toml(node.index, &node.config)?;
            write_file(&don_dir.join(override_file_name("config", node.role, position)), &config).await?;
            write_file(&don_dir.join(override_file_name("secrets", node.role, position)), &node.secrets).await?;
        }

        let env = BTreeMap::from([
            ("DEVSPACE_IMAGE".to_string(), repo.to_string()),
            ("DEVSPACE_IMAGE_TAG".to_string(), tag.to_string()),
            ("DON_BOOT_NODE_COUNT".to_string(), bootstraps.to_string()),
            ("DON_NODE_COUNT".to_string(), workers.to_string()),
            ("DON_TYPE".to_string(), spec.name.clone()),
        ]);
        self.run_step(DEPLOY_DON, env, cancel).await?;

        read_json(&don_dir.join("nodes.json")).await
    }
}

/// Builds clients for what CRIB deployed
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CribConnector: Send + Sync {
    /// Client for a deployed chain
    async fn chain(
        &self,
        input: &BlockchainInput,
        endpoints: ChainEndpoints,
    ) -> Result<WrappedBlockchainOutput, ProviderError>;

    /// Operator API of a deployed node
    fn node_api(&self, node: &CribNodeOutput) -> Result<Arc<dyn NodeApi>, ProviderError>;

    /// Client of the deployed Job Distributor
    fn job_distributor(&self, output: &CribJdOutput) -> Result<Arc<dyn JobDistributor>, ProviderError>;
}

/// Pipeline collaborators backed by a CRIB session
#[derive(Clone)]
pub struct CribProvisioner {
    session: Arc<CribSession>,
    connector: Arc<dyn CribConnector>,
}

impl std::fmt::Debug for CribProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CribProvisioner")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl CribProvisioner {
    /// Create from a started session
    #[must_use]
    pub fn new(session: Arc<CribSession>, connector: Arc<dyn CribConnector>) -> Self {
        Self { session, connector }
    }
}

fn crib_failure(err: CribError) -> ProviderError {
    ProviderError::failed("crib", err.to_string())
}

#[async_trait]
impl BlockchainProvisioner for CribProvisioner {
    async fn start(
        &self,
        input: &BlockchainInput,
        cancel: &CancellationToken,
    ) -> Result<WrappedBlockchainOutput, ProviderError> {
        let endpoints = self
            .session
            .deploy_blockchain(input, cancel)
            .await
            .map_err(crib_failure)?;
        self.connector.chain(input, endpoints).await
    }
}

#[async_trait]
impl JobDistributorLauncher for CribProvisioner {
    async fn start(&self, input: &JdInput, cancel: &CancellationToken) -> Result<JdOutput, ProviderError> {
        let output = self.session.deploy_jd(input, cancel).await.map_err(crib_failure)?;
        Ok(JdOutput {
            client: self.connector.job_distributor(&output)?,
            external_grpc_url: output.external_grpc_url,
            internal_wsrpc_url: output.internal_wsrpc_url,
        })
    }
}

#[async_trait]
impl NodeSetLauncher for CribProvisioner {
    async fn start(
        &self,
        spec: &NodeSetSpec,
        _registry_chain: &WrappedBlockchainOutput,
        cancel: &CancellationToken,
    ) -> Result<NodeSetOutput, ProviderError> {
        let outputs = self.session.deploy_don(spec, cancel).await.map_err(crib_failure)?;
        let nodes = outputs
            .iter()
            .map(|node| {
                Ok(StartedNode {
                    name: node.name.clone(),
                    host: node.internal_host.clone(),
                    external_url: node.external_url.clone(),
                    api: self.connector.node_api(node)?,
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        Ok(NodeSetOutput {
            name: spec.name.clone(),
            nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::TeamInput;
    use crate::provider::NodeLaunchSpec;
    use crate::shell::MockShellRunner;
    use parking_lot::Mutex;

    fn crib_input(dir: &Path, provider: &str) -> CribInput {
        CribInput {
            namespace: "crib-local".into(),
            folder_location: PathBuf::from("/crib"),
            provider: provider.into(),
            configs_dir: dir.to_path_buf(),
            team: None,
        }
    }

    fn recording_shell(recorded: Arc<Mutex<Vec<ShellCommand>>>) -> MockShellRunner {
        let mut shell = MockShellRunner::new();
        shell.expect_run().returning(move |command, _| {
            recorded.lock().push(command.clone());
            Ok(String::new())
        });
        shell
    }

    fn launch_spec(index: usize, role: NodeRole, image: &str) -> NodeLaunchSpec {
        NodeLaunchSpec {
            index,
            role,
            host: format!("crib-local-workflow-{index}"),
            image: image.into(),
            config: format!("[Log]\nLevel = 'debug'\n[P2P]\nPort = {index}\n"),
            secrets: "[Password]\nKeystore = 'x'\n".into(),
            env_vars: BTreeMap::new(),
        }
    }

    #[test]
    fn image_needs_explicit_tag() {
        assert_eq!(split_image_tag("repo/node:2.0").unwrap(), ("repo/node", "2.0"));
        assert_eq!(split_image_tag("localhost:5000/node:1").unwrap(), ("localhost:5000/node", "1"));
        assert!(matches!(split_image_tag("localhost:5000/node"), Err(CribError::UntaggedImage(_))));
        assert!(split_image_tag("node").is_err());
    }

    #[test]
    fn node_set_must_share_one_image() {
        assert_eq!(node_set_image(["a:1", "a:1"]).unwrap(), "a:1");
        let err = node_set_image(["a:1", "b:1"]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "all nodes in each nodeset must use the same Docker image, but 2 different images were found"
        );
        assert!(err.is_validation());
    }

    #[test]
    fn override_files_are_numbered_per_role() {
        assert_eq!(override_file_name("config", NodeRole::Bootstrap, 0), "config-override-bt-0.toml");
        assert_eq!(override_file_name("secrets", NodeRole::Worker, 2), "secrets-override-2.toml");
    }

    #[test]
    fn aws_provider_requires_team() {
        let dir = PathBuf::from("/configs");
        let mut crib = crib_input(&dir, "aws");
        assert!(matches!(
            CribSession::global_env(&crib, &dir, &BTreeMap::new()),
            Err(CribError::MissingTeam(_))
        ));

        crib.team = Some(TeamInput {
            team: "cre".into(),
            product: "keystone".into(),
            cost_center: "dev".into(),
            component: "e2e".into(),
        });
        let env = CribSession::global_env(&crib, &dir, &BTreeMap::new()).unwrap();
        assert_eq!(env["CHAINLINK_TEAM"], "cre");
        assert_eq!(env["DEVSPACE_NAMESPACE"], "crib-local");
        assert_eq!(env["CRE_CONFIG_DIR"], "/configs");
    }

    #[tokio::test]
    async fn deploy_don_writes_overrides_and_reads_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let shell = recording_shell(Arc::clone(&recorded));
        let cancel = CancellationToken::new();
        let session = CribSession::start(&crib_input(dir.path(), "kind"), &BTreeMap::new(), Arc::new(shell), &cancel)
            .await
            .unwrap();

        let nodes_json = serde_json::to_string(&vec![CribNodeOutput {
            name: "workflow-bt-0".into(),
            internal_host: "crib-local-workflow-bt-0".into(),
            external_url: "http://localhost:6688".into(),
        }])
        .unwrap();
        std::fs::create_dir_all(dir.path().join("workflow")).unwrap();
        std::fs::write(dir.path().join("workflow/nodes.json"), nodes_json).unwrap();

        let spec = NodeSetSpec {
            name: "workflow".into(),
            don_id: 1,
            nodes: vec![
                launch_spec(0, NodeRole::Bootstrap, "repo/node:2.0"),
                launch_spec(1, NodeRole::Worker, "repo/node:2.0"),
                launch_spec(2, NodeRole::Worker, "repo/node:2.0"),
            ],
            extra_allowed_ports: Vec::new(),
        };
        let nodes = session.deploy_don(&spec, &cancel).await.unwrap();
        assert_eq!(nodes.len(), 1);

        for file in [
            "config-override-bt-0.toml",
            "secrets-override-bt-0.toml",
            "config-override-0.toml",
            "config-override-1.toml",
        ] {
            assert!(dir.path().join("workflow").join(file).exists(), "{file} missing");
        }
        let worker = std::fs::read_to_string(dir.path().join("workflow/config-override-1.toml")).unwrap();
        assert!(worker.contains("Port = 2"));

        let commands = recorded.lock();
        assert_eq!(commands[0].to_string(), "devspace purge");
        let deploy = commands.last().unwrap();
        assert_eq!(deploy.to_string(), "devspace run deploy-don");
        assert_eq!(deploy.env["DEVSPACE_IMAGE"], "repo/node");
        assert_eq!(deploy.env["DEVSPACE_IMAGE_TAG"], "2.0");
        assert_eq!(deploy.env["DON_BOOT_NODE_COUNT"], "1");
        assert_eq!(deploy.env["DON_NODE_COUNT"], "2");
        assert_eq!(deploy.env["DON_TYPE"], "workflow");
        assert_eq!(deploy.env["DEVSPACE_NAMESPACE"], "crib-local");
    }

    #[tokio::test]
    async fn jd_tag_is_passed_to_devspace() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let shell = recording_shell(Arc::clone(&recorded));
        let cancel = CancellationToken::new();
        let session = CribSession::start(&crib_input(dir.path(), "kind"), &BTreeMap::new(), Arc::new(shell), &cancel)
            .await
            .unwrap();

        std::fs::write(
            dir.path().join("jd.json"),
            r#"{"external_grpc_url":"localhost:14231","internal_wsrpc_url":"jd:8080"}"#,
        )
        .unwrap();
        let output = session
            .deploy_jd(
                &JdInput {
                    image: "job-distributor:0.9.0".into(),
                    env_vars: BTreeMap::new(),
                },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(output.internal_wsrpc_url, "jd:8080");
        assert_eq!(recorded.lock().last().unwrap().env["JOB_DISTRIBUTOR_IMAGE_TAG"], "0.9.0");
    }

    #[tokio::test]
    async fn solana_chains_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let shell = recording_shell(Arc::new(Mutex::new(Vec::new())));
        let cancel = CancellationToken::new();
        let session = CribSession::start(&crib_input(dir.path(), "kind"), &BTreeMap::new(), Arc::new(shell), &cancel)
            .await
            .unwrap();

        let err = session
            .deploy_blockchain(&BlockchainInput::solana(900, 900), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CribError::UnsupportedFamily(_)));
    }
}
