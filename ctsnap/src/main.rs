use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use ctsnap::{
    backend_exists, global_tables, AddrOrder, ClockSource, Families, FlowFilter, SnapshotConfig,
    SystemClock,
};
use ipnet::IpNet;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{future::ready, net::SocketAddr, path::PathBuf, time::Duration};
use tokio::{net::TcpListener, task};
use tracing::{error, info, warn};
mod agent;
use agent::{Agent, Output};

const HZ_SAMPLE_WINDOW: Duration = Duration::from_millis(200);

/// Periodically snapshot Cilium's conntrack maps
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root of the BPF filesystem Cilium pins its maps under
    #[arg(long, default_value = ctsnap::table::DEFAULT_BPFFS_ROOT)]
    bpffs: PathBuf,

    /// Clock the datapath stamps conntrack lifetimes with
    #[arg(long, value_enum, default_value_t = ClockSource::Ktime)]
    clock_source: ClockSource,

    /// Kernel CONFIG_HZ for the jiffies clock source, detected when omitted
    #[arg(long)]
    kernel_hz: Option<u64>,

    /// Where the backend keeps the flow source address in the tuple
    #[arg(long, value_enum, default_value_t = AddrOrder::Swapped)]
    addr_order: AddrOrder,

    /// Also read the IPv6 conntrack maps
    #[arg(long)]
    ipv6: bool,

    /// Seconds between snapshots
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,

    /// Upper bound for a single snapshot, in seconds
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Take one snapshot and exit
    #[arg(long)]
    once: bool,

    /// Only report these IP protocol numbers (repeatable)
    #[arg(long = "proto")]
    protocols: Vec<u8>,

    /// Drop flows to or from loopback addresses
    #[arg(long)]
    skip_loopback: bool,

    /// Drop entries that already expired
    #[arg(long)]
    skip_expired: bool,

    /// Only report flows whose source lies in this CIDR (repeatable)
    #[arg(long = "src-net")]
    src_nets: Vec<IpNet>,

    /// Only report flows whose destination lies in this CIDR (repeatable)
    #[arg(long = "dst-net")]
    dst_nets: Vec<IpNet>,

    /// Print entries as JSON lines instead of log lines
    #[arg(long)]
    json: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "ctsnap=info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Some(addr) = args.metrics_addr {
        info!("Starting metrics server on {}", addr);
        setup_metrics_server(addr).await?;
    }

    if !backend_exists(&args.bpffs) {
        warn!(
            "no Cilium maps pinned under {}, conntrack snapshots unavailable",
            args.bpffs.display()
        );
        return Ok(());
    }

    let mut clock = SystemClock::new();
    if args.clock_source == ClockSource::Jiffies {
        let hz = match args.kernel_hz {
            Some(hz) => hz,
            None => task::spawn_blocking(move || SystemClock::new().detect_hz(HZ_SAMPLE_WINDOW))
                .await?
                .context("failed to detect kernel HZ, pass --kernel-hz")?,
        };
        info!("using kernel HZ {}", hz);
        clock = clock.with_hz(hz);
    }

    let families = Families {
        ipv4: true,
        ipv6: args.ipv6,
    };
    let filter = FlowFilter::accept_all()
        .protocols(&args.protocols)
        .src_nets(args.src_nets)
        .dst_nets(args.dst_nets);
    let filter = if args.skip_loopback {
        filter.skip_loopback()
    } else {
        filter
    };

    let agent = Agent {
        tables: global_tables(&args.bpffs, families),
        config: SnapshotConfig {
            clock_source: args.clock_source,
            addr_order: args.addr_order,
        },
        clock,
        filter,
        skip_expired: args.skip_expired,
        output: if args.json { Output::Json } else { Output::Log },
        timeout: Duration::from_secs(args.timeout_secs.max(1)),
    };

    if args.once {
        return agent.snapshot_once().await;
    }

    info!(
        "snapshotting {} conntrack tables every {}s",
        agent.tables.len(),
        args.interval_secs
    );
    let interval = Duration::from_secs(args.interval_secs.max(1));
    tokio::select! {
        _ = agent.run(interval) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!("failed to listen for shutdown signal: {}", err);
            }
            info!("shutting down");
        }
    }
    Ok::<_, anyhow::Error>(())
}

async fn setup_metrics_server(addr: SocketAddr) -> Result<(), anyhow::Error> {
    let builder = PrometheusBuilder::new();
    let recorder = builder
        .install_recorder()
        .context("failed to install prometheus recorder")?;
    describe_gauge!(
        ctsnap::snapshot::ENTRIES_COUNT_GAUGE,
        "conntrack records visited by the last snapshot"
    );
    describe_counter!(agent::SNAPSHOT_ERRORS, "failed conntrack snapshots");

    let app = Router::new().route("/metrics", get(move || ready(recorder.render())));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {addr}"))?;
    task::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("metrics server failed: {}", err);
        }
    });
    Ok(())
}
