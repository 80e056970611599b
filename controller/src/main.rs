#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use bigip_controller_core::writer::FileWriter;
use bigip_controller_k8s_api as k8s;
use bigip_controller_k8s_index::{KubeBackend, KubeStreams, Manager, Params, RouteConfig};
use clap::Parser;
use std::sync::Arc;
use tokio::{sync::watch, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[clap(
    name = "bigip-controller",
    about = "Bridges the Kubernetes resource model to BIG-IP configuration"
)]
struct Args {
    #[clap(
        long,
        default_value = "bigip_controller=info,warn",
        env = "BIGIP_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Namespaces to watch. When empty, all namespaces are watched.
    #[clap(long)]
    namespace: Vec<String>,

    /// Watch namespaces selected by this label instead of naming them.
    #[clap(long, conflicts_with = "namespace")]
    namespace_label: Option<String>,

    /// Use node InternalIP addresses for node-port pool members.
    #[clap(long)]
    use_node_internal: bool,

    /// How pool members are resolved.
    #[clap(long, value_enum, default_value = "nodeport")]
    pool_member_type: PoolMemberType,

    /// Process OpenShift Route resources.
    #[clap(long)]
    manage_routes: bool,

    /// Bind address of the shared route virtual servers.
    #[clap(long, default_value = "")]
    route_vserver_addr: String,

    /// Label selector for the route informers.
    #[clap(long)]
    route_label: Option<String>,

    /// Node list poll interval, in seconds.
    #[clap(long, default_value = "30")]
    node_poll_interval: u64,

    /// File the configuration document is written to.
    #[clap(long, default_value = "/tmp/bigip-controller.config.json")]
    output_file: std::path::PathBuf,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum PoolMemberType {
    Nodeport,
    Cluster,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        log_level,
        log_format,
        client,
        admin,
        namespace,
        namespace_label,
        use_node_internal,
        pool_member_type,
        manage_routes,
        route_vserver_addr,
        route_label,
        node_poll_interval,
        output_file,
    } = Args::parse();

    let runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin)
        .with_client(client)
        .build()
        .await?;

    let route_config = manage_routes.then(|| RouteConfig {
        vs_addr: route_vserver_addr,
        label: route_label.clone(),
    });
    let streams = Arc::new(KubeStreams::new(
        runtime.client(),
        manage_routes,
        route_label,
        namespace_label.clone(),
    ));
    let mgr = Manager::new(Params {
        backend: Arc::new(KubeBackend::new(runtime.client())),
        writer: Arc::new(FileWriter::new(output_file)),
        streams: Some(streams),
        use_node_internal,
        is_node_port: pool_member_type == PoolMemberType::Nodeport,
        route_config,
        initial_state: false,
    });

    if namespace_label.is_some() {
        mgr.add_namespace_label_informer()?;
    } else if namespace.is_empty() {
        mgr.add_namespace("")?;
    } else {
        for ns in &namespace {
            mgr.add_namespace(ns)?;
        }
    }
    info!(namespaces = ?mgr.get_watched_namespaces(), "Watching");

    // Periodic node poller feeding node-port pool membership.
    {
        let api = k8s::Api::<k8s::Node>::all(runtime.client());
        let mgr = mgr.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(node_poll_interval));
            loop {
                interval.tick().await;
                match api.list(&k8s::ListParams::default()).await {
                    Ok(nodes) => mgr.process_node_update(nodes.items),
                    Err(error) => warn!(%error, "Unable to get list of nodes"),
                }
            }
        });
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let engine = tokio::spawn(mgr.run(stop_rx));

    // Block on the shutdown signal, then let the in-flight sync complete.
    if runtime.run().await.is_err() {
        let _ = stop_tx.send(true);
        bail!("Aborted");
    }
    let _ = stop_tx.send(true);
    let _ = engine.await;
    Ok(())
}
