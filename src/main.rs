use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Api, CustomResourceExt, ResourceExt};
use tracing::info;

use astarte_k8s::controller::{self, retry::RetryPolicy, OperatorConfig};
use astarte_k8s::crd::Astarte;
use astarte_k8s::telemetry::{self, LogFormat};
use astarte_k8s::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the managed Astarte instances
    Info(InfoArgs),
    /// Print the Astarte CRD as YAML
    Crd,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Port of the REST API and metrics endpoint
    #[arg(long, env = "API_PORT", default_value_t = 8080)]
    api_port: u16,

    /// Attempts for a status write that keeps conflicting
    #[arg(long, env = "STATUS_RETRY_ATTEMPTS", default_value_t = 5)]
    status_retry_attempts: u32,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Namespace to inspect; all namespaces when unset
    #[arg(long, env = "OPERATOR_NAMESPACE")]
    namespace: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Astarte-K8s Operator v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Crd => {
            print!("{}", serde_yaml::to_string(&Astarte::crd())?);
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn astarte_api(client: kube::Client, namespace: &Option<String>) -> Api<Astarte> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;
    let astartes = astarte_api(client, &args.namespace)
        .list(&Default::default())
        .await?;

    println!("Managed Astarte instances: {}", astartes.items.len());
    for astarte in &astartes.items {
        let status = astarte.status.clone().unwrap_or_default();
        println!(
            "  {}/{}  requested {}  reconciled {}  phase {}  health {}",
            astarte.namespace().unwrap_or_default(),
            astarte.name_any(),
            astarte.spec.version,
            if status.astarte_version.is_empty() {
                "-"
            } else {
                status.astarte_version.as_str()
            },
            status.phase,
            status
                .health
                .map_or_else(|| "-".to_string(), |h| h.to_string()),
        );
    }
    Ok(())
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    telemetry::init_telemetry(format)?;

    info!(
        "Starting Astarte-K8s Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let config = OperatorConfig {
        status_retry: RetryPolicy {
            max_attempts: args.status_retry_attempts.max(1),
            ..Default::default()
        },
        ..Default::default()
    };

    let state = Arc::new(controller::ControllerState {
        client,
        config: Arc::new(config),
    });

    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        let port = args.api_port;
        tokio::spawn(async move {
            if let Err(e) = astarte_k8s::rest_api::run_server(api_state, port).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    info!("REST API disabled, ignoring port {}", args.api_port);

    let namespace = args.namespace.filter(|ns| !ns.is_empty());
    let result = controller::run_controller(state, namespace).await;

    telemetry::shutdown_telemetry();

    result
}
