//! Magpie CLI
//!
//! Anonymized multi-engine dark web reconnaissance.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use magpie_core::to_json;
use magpie_crawl::{
    create_anthropic_backend, create_openai_backend, investigate, AnthropicConfig, DispatchConfig,
    EngineRegistry, LlmTransform, OpenAiConfig, PipelineConfig, ScrapeConfig, ScrapeOrchestrator,
    SearchDispatcher,
};
use magpie_tor::{
    check_tor_connection, CircuitController, ControlConfig, EgressPool, PoolConfig,
};

#[derive(Parser)]
#[command(name = "magpie")]
#[command(author, version, about = "Magpie: anonymized dark web reconnaissance", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (0-3)
    #[arg(short, long, default_value = "1")]
    verbose: u8,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Markdown,
    Json,
    Both,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an investigation
    Query {
        /// The search query
        #[arg(short, long)]
        query: String,

        /// LLM model to use
        #[arg(short, long, default_value = "claude-sonnet-4-20250514")]
        model: String,

        /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
        #[arg(long, env = "ANTHROPIC_API_KEY")]
        anthropic_key: Option<String>,

        /// OpenAI API key (or set OPENAI_API_KEY env var)
        #[arg(long, env = "OPENAI_API_KEY")]
        api_key: Option<String>,

        /// Use OpenAI instead of Anthropic
        #[arg(long)]
        openai: bool,

        /// Number of concurrent workers for search and scrape
        #[arg(short, long, default_value = "5")]
        threads: usize,

        /// Output file for the summary (default: summary_<timestamp>.md)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "markdown")]
        format: OutputFormat,

        /// Extract and export indicators of compromise
        #[arg(long)]
        extract_iocs: bool,

        /// Rotate the Tor circuit during scraping
        #[arg(long)]
        rotate_circuit: bool,

        /// Rotate after every N requests
        #[arg(long, env = "TOR_ROTATE_INTERVAL", default_value = "5")]
        rotate_interval: u64,

        /// Skip the engine health check for faster startup
        #[arg(long)]
        skip_health_check: bool,

        /// First Tor SOCKS port
        #[arg(long, env = "TOR_SOCKS_PORT", default_value = "9050")]
        socks_port: u16,

        /// Spread load across multiple Tor instances
        #[arg(long, env = "TOR_MULTI_INSTANCE")]
        multi_instance: bool,

        /// Number of Tor instances in multi-instance mode
        #[arg(long, env = "TOR_INSTANCE_COUNT", default_value = "3")]
        instance_count: usize,

        /// Tor control port
        #[arg(long, env = "TOR_CONTROL_PORT", default_value = "9051")]
        control_port: u16,

        /// Tor control password
        #[arg(long, env = "TOR_CONTROL_PASSWORD")]
        control_password: Option<String>,
    },

    /// Check Tor connectivity and pool health
    Status {
        /// First Tor SOCKS port
        #[arg(long, env = "TOR_SOCKS_PORT", default_value = "9050")]
        socks_port: u16,

        /// Tor control port
        #[arg(long, env = "TOR_CONTROL_PORT", default_value = "9051")]
        control_port: u16,

        /// Tor control password
        #[arg(long, env = "TOR_CONTROL_PASSWORD")]
        control_password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::ERROR,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match cli.command {
        Commands::Query {
            query,
            model,
            anthropic_key,
            api_key,
            openai,
            threads,
            output,
            format,
            extract_iocs,
            rotate_circuit,
            rotate_interval,
            skip_health_check,
            socks_port,
            multi_instance,
            instance_count,
            control_port,
            control_password,
        } => {
            run_query(QueryArgs {
                query,
                model,
                anthropic_key,
                api_key,
                openai,
                threads,
                output,
                format,
                extract_iocs,
                rotate_circuit,
                rotate_interval,
                skip_health_check,
                socks_port,
                multi_instance,
                instance_count,
                control_port,
                control_password,
            })
            .await?;
        }
        Commands::Status {
            socks_port,
            control_port,
            control_password,
        } => {
            check_status(socks_port, control_port, control_password).await;
        }
    }

    Ok(())
}

struct QueryArgs {
    query: String,
    model: String,
    anthropic_key: Option<String>,
    api_key: Option<String>,
    openai: bool,
    threads: usize,
    output: Option<PathBuf>,
    format: OutputFormat,
    extract_iocs: bool,
    rotate_circuit: bool,
    rotate_interval: u64,
    skip_health_check: bool,
    socks_port: u16,
    multi_instance: bool,
    instance_count: usize,
    control_port: u16,
    control_password: Option<String>,
}

async fn run_query(args: QueryArgs) -> Result<()> {
    println!("🔍 Magpie - anonymized dark web reconnaissance\n");

    // Backend (Anthropic is the default)
    let backend = if args.openai {
        let key = args.api_key.ok_or_else(|| {
            anyhow::anyhow!("OpenAI API key required. Set OPENAI_API_KEY or use --api-key")
        })?;
        create_openai_backend(OpenAiConfig {
            api_key: key,
            model: args.model.clone(),
            ..Default::default()
        })
    } else {
        let key = args.anthropic_key.ok_or_else(|| {
            anyhow::anyhow!("Anthropic API key required. Set ANTHROPIC_API_KEY or use --anthropic-key")
        })?;
        create_anthropic_backend(AnthropicConfig::new(&key, &args.model))
    };

    let provider = if args.openai { "OpenAI" } else { "Anthropic" };
    println!("📡 Provider: {} | Model: {}", provider, args.model);
    println!("🧵 Workers: {} | Rotation: {}\n", args.threads, args.rotate_circuit);

    // Shared services, created once and injected
    let pool = Arc::new(EgressPool::new(PoolConfig {
        start_port: args.socks_port,
        instances: args.instance_count,
        multi: args.multi_instance,
    }));

    let controller = if args.rotate_circuit {
        let controller = Arc::new(CircuitController::new(ControlConfig {
            port: args.control_port,
            password: args.control_password.clone(),
            ..Default::default()
        }));
        if !controller.connect().await {
            println!("⚠️  Control port unreachable; continuing without rotation");
        }
        Some(controller)
    } else {
        None
    };

    let dispatcher = SearchDispatcher::new(
        pool.clone(),
        EngineRegistry::new(pool.clone()),
        DispatchConfig::default(),
    );
    let scraper = ScrapeOrchestrator::new(
        pool.clone(),
        controller.clone(),
        ScrapeConfig {
            rotate: args.rotate_circuit,
            rotate_interval: args.rotate_interval,
            ..Default::default()
        },
    );
    let transform = LlmTransform::new(backend);

    let pipeline_config = PipelineConfig {
        max_workers: args.threads,
        skip_health_check: args.skip_health_check,
        ..Default::default()
    };

    println!("🚀 Starting investigation...");
    let investigation = investigate(
        &args.query,
        &dispatcher,
        &scraper,
        &transform,
        None,
        &pipeline_config,
    )
    .await?;

    if let Some(controller) = &controller {
        controller.close().await;
    }

    // Write outputs
    let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let output_path = args
        .output
        .unwrap_or_else(|| PathBuf::from(format!("summary_{}.md", timestamp)));

    if matches!(args.format, OutputFormat::Markdown | OutputFormat::Both) {
        fs::write(&output_path, &investigation.summary)?;
        println!("\n📄 Summary saved to: {}", output_path.display());
    }
    if matches!(args.format, OutputFormat::Json | OutputFormat::Both) {
        let json_path = output_path.with_extension("json");
        let report = serde_json::json!({
            "query": investigation.query,
            "refined_query": investigation.refined_query,
            "results": investigation.results,
            "content": investigation.content,
            "summary": investigation.summary,
        });
        fs::write(&json_path, serde_json::to_string_pretty(&report)?)?;
        println!("📄 JSON report saved to: {}", json_path.display());
    }
    if args.extract_iocs {
        let ioc_path = output_path.with_extension("iocs.json");
        fs::write(&ioc_path, to_json(&investigation.indicators))?;
        println!("🧬 Indicators saved to: {}", ioc_path.display());
    }

    println!("\n✅ Investigation complete!");
    println!("{}", "=".repeat(60));
    let preview: String = investigation.summary.chars().take(1000).collect();
    println!("{}", preview);
    if investigation.summary.len() > 1000 {
        println!("...\n[truncated - see full summary in output file]");
    }

    Ok(())
}

async fn check_status(socks_port: u16, control_port: u16, control_password: Option<String>) {
    println!("🔌 Checking Tor connection...\n");

    let pool = Arc::new(EgressPool::new(PoolConfig {
        start_port: socks_port,
        ..Default::default()
    }));

    if check_tor_connection(&pool, Duration::from_secs(10)).await {
        println!("✅ Tor is running and accessible");
        println!("   Proxy: {}", pool.proxy_url(socks_port));
    } else {
        println!("❌ Tor is not accessible");
        println!("   Expected proxy at: {}", pool.proxy_url(socks_port));
        println!("\n   To install Tor:");
        println!("   - Linux: sudo apt install tor");
        println!("   - Mac: brew install tor");
        println!("   - Then start: sudo systemctl start tor (or brew services start tor)");
    }

    let controller = CircuitController::new(ControlConfig {
        port: control_port,
        password: control_password,
        ..Default::default()
    });

    if controller.connect().await {
        let circuits_ok = controller.verify_circuit_health().await;
        println!(
            "✅ Control port {} reachable | built circuits: {}",
            control_port,
            if circuits_ok { "yes" } else { "no" }
        );
        if let Some(exit) = controller.exit_identity().await {
            println!(
                "   Exit relay: {} ({}, {})",
                exit.nickname.as_deref().unwrap_or("unknown"),
                exit.address.as_deref().unwrap_or("unknown"),
                exit.country.as_deref().unwrap_or("unknown"),
            );
        }
        controller.close().await;
    } else {
        println!("⚠️  Control port {} not reachable (rotation unavailable)", control_port);
    }
}
