use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::core::v1::Pod;
use podnet_core::PodEvent;
use podnet_ovn::{
    AddressMode, ApiClient, ControllerConfig, MemoryPodStore, NbClient, PodDispatcher, PodStore,
    ProcessExecutor, Reconciler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Capacity of the in-process pod event channel between watch and dispatcher
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Pause before re-establishing a failed watch
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "podnet", about = "Pod network controller for OVN logical switches")]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "PODNET_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch pods on the API server and keep their logical ports in sync
    Run {
        /// API server URL
        #[arg(long, env = "PODNET_API_URL", default_value = "http://127.0.0.1:6443")]
        api_url: String,
        #[command(flatten)]
        controller: ControllerArgs,
    },
    /// Reconcile the pods in a JSON file once and exit
    Sync {
        /// File holding a pod list (`{"items": [...]}`) or a JSON array of pods
        #[arg(long)]
        pods_file: String,
        #[command(flatten)]
        controller: ControllerArgs,
    },
}

#[derive(Args)]
struct ControllerArgs {
    /// Path to the northbound CLI
    #[arg(long, env = "PODNET_NBCTL", default_value = "ovn-nbctl")]
    nbctl: String,
    /// Number of reconcile workers
    #[arg(long, env = "PODNET_WORKERS", default_value_t = 4)]
    workers: usize,
    /// Timeout for each northbound command, in seconds
    #[arg(long, env = "PODNET_TIMEOUT_SECS", default_value_t = 15)]
    timeout_secs: u64,
    /// Who assigns pod addresses: control-plane or controller
    #[arg(long, env = "PODNET_ADDRESS_MODE", default_value = "control-plane")]
    address_mode: String,
    /// Pod annotation key for the network addressing
    #[arg(long, env = "PODNET_ANNOTATION_KEY", default_value = podnet_ovn::DEFAULT_ANNOTATION_KEY)]
    annotation_key: String,
    /// Seconds between full resyncs, 0 to disable
    #[arg(long, env = "PODNET_RESYNC_SECS", default_value_t = 300)]
    resync_secs: u64,
}

impl ControllerArgs {
    fn to_config(&self) -> miette::Result<ControllerConfig> {
        let address_mode: AddressMode = self.address_mode.parse()?;
        let config = ControllerConfig {
            nbctl_path: self.nbctl.clone(),
            command_timeout: Duration::from_secs(self.timeout_secs),
            annotation_key: self.annotation_key.clone(),
            address_mode,
            workers: self.workers,
            resync_interval: (self.resync_secs > 0)
                .then(|| Duration::from_secs(self.resync_secs)),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Run {
            api_url,
            controller,
        } => run_controller(&api_url, controller.to_config()?).await,
        Commands::Sync {
            pods_file,
            controller,
        } => run_sync(&pods_file, controller.to_config()?).await,
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_reconciler(store: Arc<dyn PodStore>, config: &ControllerConfig) -> Arc<Reconciler> {
    let executor = Arc::new(ProcessExecutor::new(config.command_timeout));
    let nb = NbClient::new(executor, config.nbctl_path.clone(), config.command_timeout);
    Arc::new(Reconciler::new(nb, store, config.clone()))
}

/// Run the controller against the API server until Ctrl-C
async fn run_controller(api_url: &str, config: ControllerConfig) -> miette::Result<()> {
    info!(
        api_url,
        nbctl = %config.nbctl_path,
        address_mode = %config.address_mode,
        workers = config.workers,
        "Starting podnet controller"
    );

    let client = Arc::new(ApiClient::new(api_url));
    let store: Arc<dyn PodStore> = client.clone();
    let reconciler = build_reconciler(store.clone(), &config);
    let dispatcher = Arc::new(PodDispatcher::new(reconciler, store, &config));

    let (event_tx, event_rx) = broadcast::channel::<PodEvent>(EVENT_CHANNEL_CAPACITY);

    // The watch starts from the startup list's resourceVersion, so changes
    // made while the startup pass runs are still delivered afterwards
    let (pods, list_version) = client
        .list_pods_with_version()
        .await
        .map_err(|e| miette::miette!("Failed to list pods: {}", e))?;
    let report = dispatcher
        .start_with(&pods)
        .await
        .map_err(|e| miette::miette!("Startup resync failed: {}", e))?;
    info!(
        orphans_deleted = report.orphans_deleted,
        pods_committed = report.pods_committed,
        pods_failed = report.pods_failed,
        "Startup resync finished"
    );

    let token = CancellationToken::new();

    let dispatcher_token = token.clone();
    let dispatcher_handle = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run(event_rx, dispatcher_token).await {
                error!("Pod dispatcher error: {}", e);
            }
        })
    };

    let watch_token = token.clone();
    let watch_handle = tokio::spawn(async move {
        watch_loop(client, list_version, event_tx, watch_token).await;
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(dispatcher_handle, watch_handle);
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

/// Keep a pod watch open, resuming from the last seen resourceVersion
async fn watch_loop(
    client: Arc<ApiClient>,
    mut resource_version: Option<String>,
    tx: broadcast::Sender<PodEvent>,
    token: CancellationToken,
) {
    while !token.is_cancelled() {
        match client
            .watch_pods(resource_version.as_deref(), &tx, &token)
            .await
        {
            Ok(last) => resource_version = last,
            Err(e) => {
                // Start over; the fresh watch replays every pod as ADDED
                warn!("Pod watch failed, restarting: {}", e);
                resource_version = None;
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(WATCH_RETRY_DELAY) => {}
                }
            }
        }
    }
    info!("Pod watch stopped");
}

/// One-shot reconcile of pods read from a file, using an in-memory store
async fn run_sync(pods_file: &str, config: ControllerConfig) -> miette::Result<()> {
    let raw = tokio::fs::read_to_string(pods_file)
        .await
        .map_err(|e| miette::miette!("Failed to read '{}': {}", pods_file, e))?;
    let pods = parse_pods(&raw)
        .map_err(|e| miette::miette!("Failed to parse pods from '{}': {}", pods_file, e))?;
    info!(pods = pods.len(), "Loaded pods from {}", pods_file);

    let store = Arc::new(MemoryPodStore::with_pods(pods)?);
    let reconciler = build_reconciler(store.clone(), &config);
    let dispatcher = PodDispatcher::new(reconciler, store, &config);

    let report = dispatcher
        .start()
        .await
        .map_err(|e| miette::miette!("Resync failed: {}", e))?;
    info!(
        orphans_deleted = report.orphans_deleted,
        pods_committed = report.pods_committed,
        pods_failed = report.pods_failed,
        "Sync finished"
    );
    if report.pods_failed > 0 {
        return Err(miette::miette!("{} pods failed to sync", report.pods_failed));
    }
    Ok(())
}

fn parse_pods(raw: &str) -> Result<Vec<Pod>, serde_json::Error> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum PodsFile {
        List { items: Vec<Pod> },
        Array(Vec<Pod>),
    }
    Ok(match serde_json::from_str::<PodsFile>(raw)? {
        PodsFile::List { items } => items,
        PodsFile::Array(items) => items,
    })
}
