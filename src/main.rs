use anyhow::{bail, Context, Result};
use gatelink::cable::new_driver;
use gatelink::nat_discovery::NatOutcome;
use gatelink::{decide_mode, Endpoint, NatDiscovery, NatDiscoveryConfig, NatEndpointInfo};
use std::{
    collections::{HashMap, HashSet},
    env, fs,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::{prelude::*, EnvFilter};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    init_logging(&env::var("GATELINK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()))?;

    match args[1].as_str() {
        "discover" => {
            if args.len() < 4 {
                eprintln!("Usage: {} discover <local.json> <remote.json>...", args[0]);
                std::process::exit(1);
            }
            run_discover(&args[2], &args[3..])?
        }
        "mode" => {
            if args.len() != 4 {
                eprintln!("Usage: {} mode <local.json> <remote.json>", args[0]);
                std::process::exit(1);
            }
            run_mode(&args[2], &args[3])?
        }
        "connect" => {
            if args.len() != 4 {
                eprintln!("Usage: {} connect <local.json> <remote.json>", args[0]);
                std::process::exit(1);
            }
            run_connect(&args[2], &args[3])?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("gatelink - NAT discovery and cable negotiation between cluster gateways");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} discover <local.json> <remote.json>...  # Resolve reachable address of each remote", program_name);
    eprintln!("  {} mode <local.json> <remote.json>         # Print negotiated operation mode", program_name);
    eprintln!("  {} connect <local.json> <remote.json>      # Discover, then connect with the cable driver", program_name);
    eprintln!();
    eprintln!("discover and connect wait briefly after the last result so a private IP");
    eprintln!("that answers after the public one can still replace it.");
    eprintln!();
    eprintln!("Endpoint files are JSON, for example:");
    eprintln!("  {{\"cableName\": \"cluster-a-ep-1\", \"clusterId\": \"cluster-a\",");
    eprintln!("   \"publicIP\": \"10.1.1.1\", \"privateIP\": \"2.2.2.2\", \"backend\": \"ipsec\",");
    eprintln!("   \"backendConfig\": {{\"preferred-server\": \"true\"}}, \"natDiscoveryPort\": 4490}}");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  GATELINK_LOG_LEVEL             Log filter when RUST_LOG is unset (default: info)");
    eprintln!("  GATELINK_NAT_TIMEOUT_SECS      Seconds before an unanswered probe is resent");
    eprintln!("  GATELINK_NAT_MAX_ATTEMPTS      Probes per address before giving up");
    eprintln!("  GATELINK_NAT_SCAN_INTERVAL_MS  Retry scan period");
    eprintln!("  GATELINK_NAT_PREFER_PRIVATE    Prefer private IP resolution (true/false)");
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn load_endpoint(path: impl AsRef<Path>) -> Result<Endpoint> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read endpoint file {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("Invalid endpoint description in {}", path.display()))
}

/// How long to keep listening after every remote has a result, so a
/// private IP resolving after the public one can still replace it
const CORRECTION_GRACE: Duration = Duration::from_millis(500);

/// Run NAT discovery until every remote is resolved or given up on
async fn discover(local: Arc<Endpoint>, remotes: Vec<Arc<Endpoint>>) -> Result<Vec<NatEndpointInfo>> {
    let config = NatDiscoveryConfig::from_env()?;
    let engine = NatDiscovery::new(local, config);
    engine.start().await?;

    let (ready_tx, ready_rx) = mpsc::channel(remotes.len().max(1) * 2);
    engine.set_result_sink(ready_tx).await;

    let mut names = HashSet::new();
    for remote in remotes {
        names.insert(remote.cable_name.clone());
        engine.add_remote_endpoint(remote).await;
    }

    let results = collect_results(ready_rx, names, CORRECTION_GRACE).await;

    engine.stop().await;
    Ok(results)
}

/// Gather one result per cable name. Once all are in, later results are
/// accepted until `grace` passes without one; the newest result wins.
async fn collect_results(
    mut ready_rx: mpsc::Receiver<NatEndpointInfo>,
    names: HashSet<String>,
    grace: Duration,
) -> Vec<NatEndpointInfo> {
    let mut results: HashMap<String, NatEndpointInfo> = HashMap::new();

    while results.len() < names.len() {
        let Some(info) = ready_rx.recv().await else {
            break;
        };
        if names.contains(&info.endpoint.cable_name) {
            results.insert(info.endpoint.cable_name.clone(), info);
        }
    }

    while let Ok(Some(info)) = tokio::time::timeout(grace, ready_rx.recv()).await {
        if names.contains(&info.endpoint.cable_name) {
            debug!(cable_name = %info.endpoint.cable_name, "Replacing earlier NAT discovery result");
            results.insert(info.endpoint.cable_name.clone(), info);
        }
    }

    let mut results: Vec<_> = results.into_values().collect();
    results.sort_by(|a, b| a.endpoint.cable_name.cmp(&b.endpoint.cable_name));
    results
}

fn print_result(info: &NatEndpointInfo) {
    match &info.outcome {
        NatOutcome::Reachable {
            use_ip,
            use_port,
            use_nat,
            via,
        } => println!(
            "{}: reachable at {}:{} via {} IP (NAT: {})",
            info.endpoint.cable_name, use_ip, use_port, via, use_nat
        ),
        NatOutcome::Unreachable => println!("{}: unreachable", info.endpoint.cable_name),
    }
}

fn run_discover(local_path: &str, remote_paths: &[String]) -> Result<()> {
    let local = Arc::new(load_endpoint(local_path)?);
    let remotes = remote_paths
        .iter()
        .map(|path| load_endpoint(path).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let results = runtime.block_on(discover(local, remotes))?;

    for info in &results {
        print_result(info);
    }

    Ok(())
}

fn run_mode(local_path: &str, remote_path: &str) -> Result<()> {
    let local = load_endpoint(local_path)?;
    let remote = load_endpoint(remote_path)?;

    println!("{}", decide_mode(&local, &remote));
    Ok(())
}

fn run_connect(local_path: &str, remote_path: &str) -> Result<()> {
    let local = Arc::new(load_endpoint(local_path)?);
    let remote = Arc::new(load_endpoint(remote_path)?);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut driver = new_driver(local.subnets.clone(), local.clone())
            .context("Failed to create cable driver")?;
        driver.init().await?;

        let results = discover(local, vec![remote]).await?;
        let Some(info) = results.first() else {
            bail!("NAT discovery finished without a result");
        };
        print_result(info);

        let ip = driver.connect_to_endpoint(info).await?;
        println!(
            "Connected to {} at {} using {} driver",
            info.endpoint.cable_name,
            ip,
            driver.name()
        );
        Ok::<(), anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink::nat_discovery::AddressKind;

    fn reachable(name: &str, ip: &str, via: AddressKind) -> NatEndpointInfo {
        NatEndpointInfo {
            endpoint: Arc::new(Endpoint::new(name, "cluster-b", "10.3.3.3", "4.4.4.4")),
            outcome: NatOutcome::Reachable {
                use_ip: ip.parse().unwrap(),
                use_port: 4490,
                use_nat: false,
                via,
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_private_result_replaces_public() {
        let (tx, rx) = mpsc::channel(10);
        let names = HashSet::from(["cluster-b-ep-1".to_string()]);

        tx.send(reachable("cluster-b-ep-1", "10.3.3.3", AddressKind::Public))
            .await
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx
                .send(reachable("cluster-b-ep-1", "4.4.4.4", AddressKind::Private))
                .await;
            // keep the channel open past the grace period
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let results = collect_results(rx, names, Duration::from_millis(500)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].use_ip(), Some("4.4.4.4".parse().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_after_grace_is_ignored() {
        let (tx, rx) = mpsc::channel(10);
        let names = HashSet::from(["cluster-b-ep-1".to_string()]);

        tx.send(reachable("cluster-b-ep-1", "10.3.3.3", AddressKind::Public))
            .await
            .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = tx
                .send(reachable("cluster-b-ep-1", "4.4.4.4", AddressKind::Private))
                .await;
        });

        let results = collect_results(rx, names, Duration::from_millis(500)).await;
        assert_eq!(results[0].use_ip(), Some("10.3.3.3".parse().unwrap()));
    }
}
