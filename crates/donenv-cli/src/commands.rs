//! `env start` and `env stop`

use crate::cli::StartArgs;
use crate::config::EnvConfig;
use crate::exec::ExecBackend;
use anyhow::Context;
use donenv_core::chain::ContractKind;
use donenv_core::crib::{CribConnector, CribProvisioner, CribSession};
use donenv_core::prelude::*;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Printed when cleanup after a failed start fails too
pub const STRANDED_RESOURCES: &str = "unexpected startup error. this may have stranded resources. please manually \
                                      remove containers with 'ctf' label and delete their volumes";

/// How a start ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Environment is up
    Ready,
    /// Setup failed or panicked; cleanup ran
    Failed,
    /// Interrupted by a signal; cleanup ran
    Interrupted,
}

/// Collaborators for the configured infrastructure
///
/// # Errors
/// Fails if the CRIB session cannot be opened.
pub async fn collaborators(
    config: &EnvConfig,
    shell: Arc<dyn ShellRunner>,
    cancel: &CancellationToken,
) -> anyhow::Result<Collaborators> {
    let backend = Arc::new(ExecBackend::new(Arc::clone(&shell), config.backend.as_str(), cancel.clone()));

    match &config.infra {
        InfraInput::Docker => Ok(Collaborators {
            blockchains: Arc::clone(&backend) as Arc<dyn BlockchainProvisioner>,
            contracts: Arc::clone(&backend) as Arc<dyn ContractDeployer>,
            node_sets: Arc::clone(&backend) as Arc<dyn NodeSetLauncher>,
            jd: backend as Arc<dyn JobDistributorLauncher>,
        }),
        InfraInput::Crib(crib) => {
            let nix: Arc<dyn ShellRunner> = Arc::new(ProcessShell::nix(&crib.folder_location));
            let session = CribSession::start(crib, &BTreeMap::new(), nix, cancel)
                .await
                .context("opening crib session")?;
            let connector = Arc::clone(&backend) as Arc<dyn CribConnector>;
            let provisioner = Arc::new(CribProvisioner::new(Arc::new(session), connector));

            Ok(Collaborators {
                blockchains: Arc::clone(&provisioner) as Arc<dyn BlockchainProvisioner>,
                contracts: backend as Arc<dyn ContractDeployer>,
                node_sets: Arc::clone(&provisioner) as Arc<dyn NodeSetLauncher>,
                jd: provisioner as Arc<dyn JobDistributorLauncher>,
            })
        }
    }
}

/// Provision an environment from the command line
///
/// # Errors
/// Fails only if the config cannot be loaded; setup failures are reported
/// through the outcome.
pub async fn start(args: StartArgs) -> anyhow::Result<StartOutcome> {
    let config = EnvConfig::resolve(args.config.as_deref(), args.topology)?;
    let input = config.setup_input(args.extra_allowed_ports)?;
    tracing::info!(topology = %args.topology, dons = input.node_sets.len(), "starting environment");

    let shell: Arc<dyn ShellRunner> = Arc::new(ProcessShell::new());
    let cleaner = DockerCleaner::new(Arc::clone(&shell));
    let cancel = CancellationToken::new();

    let startup = {
        let cancel = cancel.clone();
        async move {
            let collaborators = collaborators(&config, shell, &cancel).await?;
            let ctx = OperationContext::new(cancel);
            Ok::<_, anyhow::Error>(setup_test_environment(&ctx, &collaborators, input).await?)
        }
    };

    Ok(supervise(startup, shutdown_signal(), &cleaner, args.wait_on_error_timeout, &cancel).await)
}

/// Run a startup future, cleaning up on failure, panic or signal
pub async fn supervise<F, S>(
    startup: F,
    signal: S,
    cleaner: &dyn ContainerCleaner,
    wait_on_error: Duration,
    cancel: &CancellationToken,
) -> StartOutcome
where
    F: Future<Output = anyhow::Result<SetupOutput>>,
    S: Future<Output = ()>,
{
    let startup = AssertUnwindSafe(startup).catch_unwind();

    tokio::select! {
        outcome = startup => {
            match outcome {
                Ok(Ok(env)) => {
                    println!("{}", summary(&env));
                    return StartOutcome::Ready;
                }
                Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "environment setup failed"),
                Err(panic) => tracing::error!(panic = %panic_message(panic.as_ref()), "environment setup panicked"),
            }
            if !wait_on_error.is_zero() {
                tracing::info!(wait = %humantime::format_duration(wait_on_error), "waiting before cleanup");
                tokio::time::sleep(wait_on_error).await;
            }
            clean_up(cleaner).await;
            StartOutcome::Failed
        }
        () = signal => {
            tracing::warn!("received shutdown signal, cleaning up");
            cancel.cancel();
            clean_up(cleaner).await;
            StartOutcome::Interrupted
        }
    }
}

async fn clean_up(cleaner: &dyn ContainerCleaner) {
    match cleaner.remove_test_containers(&CancellationToken::new()).await {
        Ok(count) => tracing::info!(count, "removed test containers"),
        Err(err) => {
            tracing::error!(error = %err, "cleanup failed");
            eprintln!("{STRANDED_RESOURCES}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolves on SIGINT or SIGTERM; never resolves if handlers cannot be installed
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            tracing::warn!(error = %err, "ctrl-c handler failed");
                            std::future::pending::<()>().await;
                        }
                    }
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler failed");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Remove every test container; safe to run when nothing is running
///
/// # Errors
/// Fails if docker cannot be queried.
pub async fn stop(cleaner: &dyn ContainerCleaner) -> anyhow::Result<usize> {
    cleaner
        .remove_test_containers(&CancellationToken::new())
        .await
        .context("removing test containers")
}

/// Human-readable description of a ready environment
#[must_use]
pub fn summary(env: &SetupOutput) -> String {
    let topology = &env.don_topology.topology;
    let mut out = String::new();

    let _ = writeln!(out, "Environment ready");
    let _ = writeln!(out, "  DONs: {}, nodes: {}", topology.dons.len(), topology.node_count());
    for (don, nodes) in env.don_topology.dons() {
        let _ = writeln!(out, "  DON {} (id {}, {})", don.name, don.id, don.flags);
        for node in nodes {
            let _ = writeln!(out, "    {} {}", node.started.name, node.started.external_url);
        }
    }
    for chain in &env.blockchains {
        let _ = writeln!(
            out,
            "  Chain {} ({}): {}",
            chain.chain_id,
            chain.family(),
            chain.endpoints.external_http_url
        );
    }
    let _ = writeln!(out, "  Job Distributor: {}", env.jd.external_grpc_url);
    for kind in [
        ContractKind::CapabilitiesRegistry,
        ContractKind::WorkflowRegistry,
        ContractKind::Ocr3Capability,
    ] {
        if let Some(address) = env.addresses.get(topology.home_chain_selector, kind) {
            let _ = writeln!(out, "  {kind}: {address}");
        }
    }
    if let Some(gateway) = &topology.gateway_connector {
        let _ = writeln!(out, "  Gateway: {}", gateway.node_url());
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use donenv_test_utils::{setup_input, workflow_node_set, FakeCleaner, FakeEnvironment};

    fn never() -> impl Future<Output = ()> {
        std::future::pending()
    }

    #[tokio::test]
    async fn ready_environment_skips_cleanup() {
        let fakes = FakeEnvironment::new();
        let cleaner = FakeCleaner::default();
        let cancel = CancellationToken::new();
        let ctx = OperationContext::new(cancel.clone());
        let collaborators = fakes.collaborators();

        let startup = async {
            Ok::<_, anyhow::Error>(
                setup_test_environment(&ctx, &collaborators, setup_input(vec![workflow_node_set(4)])).await?,
            )
        };
        let outcome = supervise(startup, never(), &cleaner, Duration::ZERO, &cancel).await;

        assert_eq!(outcome, StartOutcome::Ready);
        assert_eq!(cleaner.calls(), 0);
    }

    #[tokio::test]
    async fn failed_setup_cleans_up() {
        let cleaner = FakeCleaner::default();
        let startup = async { Err::<SetupOutput, _>(anyhow::anyhow!("chain did not start")) };

        let outcome = supervise(startup, never(), &cleaner, Duration::ZERO, &CancellationToken::new()).await;

        assert_eq!(outcome, StartOutcome::Failed);
        assert_eq!(cleaner.calls(), 1);
    }

    async fn explode() -> anyhow::Result<SetupOutput> {
        panic!("node launcher exploded")
    }

    #[tokio::test]
    async fn panicking_setup_cleans_up_even_if_cleanup_fails() {
        let cleaner = FakeCleaner::failing();

        let outcome = supervise(explode(), never(), &cleaner, Duration::ZERO, &CancellationToken::new()).await;

        assert_eq!(outcome, StartOutcome::Failed);
        assert_eq!(cleaner.calls(), 1);
    }

    #[tokio::test]
    async fn signal_cancels_and_cleans_up() {
        let cleaner = FakeCleaner::default();
        let cancel = CancellationToken::new();

        let outcome = supervise(
            std::future::pending::<anyhow::Result<SetupOutput>>(),
            async {},
            &cleaner,
            Duration::from_secs(60),
            &cancel,
        )
        .await;

        assert_eq!(outcome, StartOutcome::Interrupted);
        assert!(cancel.is_cancelled());
        assert_eq!(cleaner.calls(), 1);
    }

    #[tokio::test]
    async fn stop_with_nothing_running_is_ok() {
        let cleaner = FakeCleaner::default();
        assert_eq!(stop(&cleaner).await.unwrap(), 0);
        assert_eq!(stop(&cleaner).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn summary_lists_nodes_and_contracts() {
        let fakes = FakeEnvironment::new();
        let ctx = OperationContext::new(CancellationToken::new());
        let env = setup_test_environment(&ctx, &fakes.collaborators(), setup_input(vec![workflow_node_set(4)]))
            .await
            .unwrap();

        let text = summary(&env);
        assert!(text.starts_with("Environment ready"));
        assert!(text.contains("DONs: 1, nodes: 4"));
        assert!(text.contains("workflow-node3"));
        assert!(text.contains("CapabilitiesRegistry: 0x"));
        assert!(text.contains("Job Distributor: localhost:14231"));
    }
}
