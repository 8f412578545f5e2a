//! tenantcnid - tenant CNI node agent

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tenantcni::bootstrap::{
    discover_node, prepare_ipam, register_default_tenant, ClusterBootstrap, KubeBootstrap,
    NodeEnv,
};
use tenantcni::config::{
    ControllerConfig, LabelConfig, NodeStoreConfig, DEFAULT_LABEL_DOMAIN, DEFAULT_PLUGIN_NAME,
    DEFAULT_STATE_DIR, DEFAULT_SUBNET_PREFIX,
};
use tenantcni::controller::{
    watch_tenants, Context, EventTranslator, KubeClusterApi, TenantController,
};
use tenantcni::crd::Tenant;
use tenantcni::retry::{retry_with_backoff, BackoffConfig};

/// Attempts for each startup API call before giving up
const STARTUP_ATTEMPTS: u32 = 10;

/// tenantcni - per-node tenant IPAM controller
#[derive(Parser, Debug)]
#[command(name = "tenantcnid", version, about, long_about = None)]
struct Cli {
    /// Generate the Tenant CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node agent (default mode)
    ///
    /// Seeds this node's subnet pool, watches Tenants and allocates a
    /// subnet for every tenant that lists this node.
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Directory holding the per-node state file
    #[arg(long, env = "TENANTCNI_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Prefix length of each tenant subnet
    #[arg(long, default_value_t = DEFAULT_SUBNET_PREFIX, value_parser = clap::value_parser!(u8).range(1..=32))]
    subnet_prefix: u8,

    /// Number of reconcile workers
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Deadline for each Kubernetes API call, in seconds
    #[arg(long, default_value_t = 10)]
    api_timeout_secs: u64,

    /// Interval between full resyncs of every tenant, in seconds
    #[arg(long, default_value_t = 600)]
    resync_secs: u64,

    /// Reverse-domain prefix of the per-tenant node label
    #[arg(long, default_value = DEFAULT_LABEL_DOMAIN)]
    label_domain: String,

    /// Plugin segment of the per-tenant node label
    #[arg(long, default_value = DEFAULT_PLUGIN_NAME)]
    plugin_name: String,

    /// Create the `default` tenant spanning every node if missing
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    register_default_tenant: bool,

    /// Name of this node
    #[arg(long, env = "MY_NODE_NAME")]
    node_name: Option<String>,

    /// Name of this pod, used to find the node when the node name is unset
    #[arg(long, env = "MY_POD_NAME")]
    pod_name: Option<String>,

    /// Namespace of this pod
    #[arg(long, env = "MY_POD_NAMESPACE")]
    pod_namespace: Option<String>,

    /// IP of this node; defaults to its InternalIP address
    #[arg(long, env = "MY_NODE_IP")]
    node_ip: Option<String>,
}

impl ControllerArgs {
    fn node_env(&self) -> NodeEnv {
        NodeEnv {
            node_name: self.node_name.clone(),
            pod_name: self.pod_name.clone(),
            pod_namespace: self.pod_namespace.clone(),
            node_ip: self.node_ip.clone(),
        }
    }

    fn controller_config(&self, node_name: String) -> ControllerConfig {
        let mut config = ControllerConfig::new(node_name);
        config.labels = LabelConfig {
            domain: self.label_domain.clone(),
            plugin: self.plugin_name.clone(),
        };
        config.workers = self.workers;
        config.api_timeout = Duration::from_secs(self.api_timeout_secs);
        config.resync_interval = Duration::from_secs(self.resync_secs.max(1));
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Tenant::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::parse_from(["tenantcnid"]),
    };
    run_controller(args).await
}

/// Run the node agent until SIGINT or SIGTERM
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("tenantcni controller starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let bootstrap = KubeBootstrap::new(client.clone());
    let startup = BackoffConfig::with_max_attempts(STARTUP_ATTEMPTS);

    // The agent installs its own CRD so its schema always matches the binary
    retry_with_backoff(&startup, "install Tenant CRD", || bootstrap.install_crd()).await?;

    let env = args.node_env();
    let identity =
        retry_with_backoff(&startup, "discover node", || discover_node(&env, &bootstrap)).await?;

    let ipam = prepare_ipam(
        &NodeStoreConfig::new(&args.state_dir),
        &identity,
        args.subnet_prefix,
    )?;

    if args.register_default_tenant {
        if let Err(e) = retry_with_backoff(&startup, "register default tenant", || {
            register_default_tenant(&bootstrap)
        })
        .await
        {
            // Other agents race for the same tenant; it is not needed to run
            tracing::warn!(error = %e, "Failed to register default tenant, continuing anyway");
        }
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let config = args.controller_config(identity.name.clone());
    let (translator, store) = EventTranslator::new();
    let ctx = Arc::new(Context::new(
        &config,
        ipam,
        Arc::new(store.clone()),
        Arc::new(KubeClusterApi::new(client.clone())),
    ));
    let controller = TenantController::new(ctx, &config);

    let tenants: Api<Tenant> = Api::all(client);
    let watch = tokio::spawn(watch_tenants(
        tenants,
        translator,
        controller.queue().clone(),
        shutdown.clone(),
    ));

    // Workers start once the cache holds the initial list
    tokio::select! {
        _ = shutdown.cancelled() => {}
        ready = store.wait_until_ready() => {
            ready.map_err(|e| anyhow::anyhow!("Tenant cache failed to sync: {}", e))?;
            tracing::info!(tenants = store.state().len(), "tenant cache synced");
        }
    }

    controller.run(shutdown.clone()).await;
    watch
        .await
        .map_err(|e| anyhow::anyhow!("Tenant watch task failed: {}", e))?;

    tracing::info!("tenantcni controller stopped");
    Ok(())
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
    shutdown.cancel();
}
