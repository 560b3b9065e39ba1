use clap::{Parser, Subcommand};

mod commands;
mod scenario;

#[derive(Parser)]
#[command(
    name = "nodeplan",
    about = "nodeplan: node provisioning planner for pending pods",
    version,
    propagate_version = true,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one dry-run provisioning pass over a scenario.
    ///
    /// The scenario file (TOML, or JSON by extension) holds the nodeplan
    /// configuration, the cluster snapshot and the cloud inventory. Nothing
    /// is launched; the planned nodes are printed.
    Simulate {
        /// Scenario file
        #[arg(short, long)]
        scenario: String,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
        /// Refuse launches once this many nodes were planned
        #[arg(long)]
        quota: Option<usize>,
    },
    /// Validate the NodePools and NodeClasses of a scenario
    Validate {
        #[arg(short, long)]
        scenario: String,
    },
    /// List the instance types a NodePool would consider
    Catalog {
        #[arg(short, long)]
        scenario: String,
        /// NodePool whose NodeClass shapes the catalog. Without it, the
        /// default node profile is used and every instance type is listed.
        #[arg(short, long)]
        pool: Option<String>,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Generate a nodeplan.toml scaffold
    Init {
        #[arg(short, long)]
        cluster: String,
        #[arg(short, long, default_value = "us-west-2")]
        region: String,
        /// Output file
        #[arg(short, long, default_value = "nodeplan.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("nodeplan=debug".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { scenario, format, quota } => {
            commands::simulate::simulate(&scenario, &format, quota).await
        }
        Commands::Validate { scenario } => commands::validate::validate(&scenario),
        Commands::Catalog { scenario, pool, format } => {
            commands::catalog::catalog(&scenario, pool.as_deref(), &format)
        }
        Commands::Init { cluster, region, output } => {
            commands::init::init(&cluster, &region, &output)
        }
    }
}
