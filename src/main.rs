use chainmesh::config::Config;
use chainmesh::error::AppError;
use chainmesh::ledger::{Ledger, MemoryLedger};
use chainmesh::logging::{setup_logging, short_hostname};
use chainmesh::network::envelope::NodeIdentity;
use chainmesh::node::Node;
use chainmesh::shutdown::ShutdownManager;
use chainmesh::types::Block;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "chainmeshd")]
#[command(about = "chainmesh peer-to-peer sync daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    listen_addr: Option<String>,

    /// Persistent peer to keep connected (repeatable)
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Write the default config to --config and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    if args.generate_config {
        Config::default().save_to_file(&args.config)?;
        println!("✓ Wrote default config to {}", args.config);
        return Ok(());
    }

    let mut config = Config::load_or_create(&args.config)?;
    if let Some(addr) = args.listen_addr {
        config.network.listen_address = addr;
    }
    config.network.persistent_peers.extend(args.connect);
    config.validate()?;

    let _log_guard = setup_logging(&config.logging, args.verbose);
    tracing::info!(
        "🚀 chainmeshd v{} ({}) starting on {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        short_hostname()
    );

    let key_path = config.node_key_path();
    let identity = NodeIdentity::load_or_generate(&key_path)
        .map_err(|e| AppError::NodeKey(format!("{}: {}", key_path.display(), e)))?;

    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new(Block::genesis()));

    let mut shutdown = ShutdownManager::new();
    let node = Node::build(config, Arc::new(identity), ledger, shutdown.token()).await?;
    let (_handle, tasks) = node.spawn();
    shutdown.register_tasks(tasks);

    shutdown.wait_for_shutdown().await;
    Ok(())
}
