use clap::Parser;
use tracing::{debug, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use transit_agent::config::read_config_file;
use transit_agent::service::AgentService;
use transit_agent::util::get_config_path;

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (falls back to AGENT_CONFIG, then ./agent.json)
    #[arg(short)]
    file: Option<String>,

    /// Skip connecting to the broker and starting delivery
    #[arg(long)]
    no_transport: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("transit_agent", LevelFilter::TRACE),
        ("agent", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let path = args.file.unwrap_or_else(get_config_path);
    let connector = read_config_file(&path)?;

    let agent = AgentService::new(connector);
    agent.hook_signals();

    agent.start_controller().await?;
    if !args.no_transport {
        agent.start_nats().await?;
        agent.start_transport().await?;
    }
    let status = agent.status().await;
    debug!(?status, "agent running");

    agent.quit().await;
    let stats = agent.stats();
    debug!(?stats, "final delivery stats");

    Ok(())
}
