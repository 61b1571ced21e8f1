use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use forgepool::config::PoolConfig;
use forgepool::core::params::epoch_of;
use forgepool::core::types::*;
use forgepool::events::LogSink;
use forgepool::pool::{self, Pool};
use forgepool::pow::{ForgeHash, PowEngine};
use forgepool::upstream::RpcUpstream;

#[derive(Parser)]
#[command(name = "forgepool", version = "0.4.2")]
#[command(about = "ForgePool - mining pool stratum server")]
struct Cli {
    /// Log filter directive (overrides the forgepool=info default)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stratum server
    Run {
        /// JSON config file; built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Upstream node JSON-RPC address (host:port)
        #[arg(short, long)]
        upstream: Option<String>,
    },
    /// Print the default configuration as JSON
    DefaultConfig,
    /// Evaluate the PoW for one header/nonce offline
    Hash {
        #[arg(long)]
        height: u64,
        #[arg(long)]
        header: String,
        #[arg(long)]
        nonce: String,
        /// Dataset size in bytes (defaults to the pool default)
        #[arg(long)]
        dataset_size: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();

    let directive = cli.log_level.as_deref().unwrap_or("forgepool=info");
    let filter = match directive.parse() {
        Ok(d) => tracing_subscriber::EnvFilter::from_default_env().add_directive(d),
        Err(e) => {
            eprintln!("❌ Bad log level '{}': {}", directive, e);
            std::process::exit(2);
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let code = match cli.command {
        Commands::Run { config, upstream } => run(config, upstream),
        Commands::DefaultConfig => {
            match serde_json::to_string_pretty(&PoolConfig::default()) {
                Ok(json) => {
                    println!("{}", json);
                    0
                }
                Err(e) => {
                    eprintln!("❌ {}", e);
                    1
                }
            }
        }
        Commands::Hash { height, header, nonce, dataset_size } => {
            hash(height, &header, &nonce, dataset_size)
        }
    };
    std::process::exit(code);
}

fn run(config_path: Option<PathBuf>, upstream: Option<String>) -> i32 {
    let mut config = match &config_path {
        Some(path) => match PoolConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("❌ {}", e);
                return 1;
            }
        },
        None => PoolConfig::default(),
    };
    if let Some(addr) = upstream {
        config.upstream = addr;
    }
    if let Err(e) = config.validate() {
        eprintln!("❌ {}", e);
        return 1;
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("❌ Cannot start runtime: {}", e);
            return 1;
        }
    };

    rt.block_on(async move {
        println!("🚀 ForgePool v{}", env!("CARGO_PKG_VERSION"));
        println!("  Upstream:  {}", config.upstream);
        for p in &config.ports {
            println!("  Port:      {} (diff {}, vardiff {})", p.port, p.difficulty, p.var_diff);
        }
        println!("  Epoch:     {} blocks, dataset {} bytes", config.epoch_length, config.dataset_size);

        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        if let Err(e) = ctrlc::set_handler(move || {
            println!("\n🛑 Shutting down gracefully...");
            let _ = stop_tx.send(true);
        }) {
            tracing::warn!("Cannot install Ctrl-C handler: {}", e);
        }

        let upstream = Arc::new(
            RpcUpstream::new(config.upstream.clone()).with_timeout(config.upstream_timeout()),
        );
        tracing::debug!("Upstream node at {} (timeout {:?})", upstream.addr(), config.upstream_timeout());
        let pool = match Pool::from_config(config, upstream, Arc::new(LogSink)) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("❌ {}", e);
                return 1;
            }
        };

        match pool::run(pool, stop_rx).await {
            Ok(()) => {
                tracing::info!("👋 Shutdown complete.");
                0
            }
            Err(e) => {
                tracing::error!("❌ {}", e);
                1
            }
        }
    })
}

fn hash(height: u64, header: &str, nonce: &str, dataset_size: Option<usize>) -> i32 {
    let Some(header_hash) = parse_hash(header) else {
        eprintln!("❌ Header must be 32 bytes of hex");
        return 1;
    };
    let Some(nonce) = parse_nonce(nonce) else {
        eprintln!("❌ Nonce must be 16 hex digits");
        return 1;
    };

    let defaults = PoolConfig::default();
    let engine = ForgeHash::new(dataset_size.unwrap_or(defaults.dataset_size));
    let epoch = epoch_of(height, defaults.epoch_length);

    let t0 = Instant::now();
    let dataset = match engine.generate(epoch) {
        Ok(ds) => ds,
        Err(e) => {
            eprintln!("❌ {}", e);
            return 1;
        }
    };
    println!("🧮 Epoch #{} dataset in {:.2}s", epoch, t0.elapsed().as_secs_f64());

    match engine.compute(&dataset, &header_hash, nonce) {
        Ok(out) => {
            println!("  Seed:       {}", hash_to_hex(&dataset.seed));
            println!("  Mix:        {}", hash_to_hex(&out.mix_hash));
            println!("  Result:     {}", hash_to_hex(&out.result));
            println!("  Difficulty: {:.2}", target_to_difficulty(&out.result));
            0
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            1
        }
    }
}
