//! pgkeeper - cluster-state reconciliation for Patroni-managed PostgreSQL

mod runtime;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use pgkeeper_cluster::ha::{RenderParams, DEFAULT_HA_URL};
use pgkeeper_cluster::supervisor::DEFAULT_SUPERVISOR_URL;
use pgkeeper_cluster::Context;
use pgkeeper_common::config::DatabaseConfig;
use pgkeeper_common::kube_utils::create_client;
use pgkeeper_common::leader_election::LeaderElector;
use pgkeeper_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use pgkeeper_common::ClusterIdentity;

use crate::runtime::Runtime;

/// pgkeeper - keeps a Patroni-managed PostgreSQL member and its cluster state in shape
#[derive(Parser, Debug)]
#[command(name = "pgkeeper", version, about, long_about = None)]
struct Cli {
    /// Application name; members are `<app>-<ordinal>`
    #[arg(long, env = "PGKEEPER_APP")]
    app: String,

    /// Namespace the cluster runs in
    #[arg(long, env = "POD_NAMESPACE")]
    namespace: String,

    /// Name of this member's Pod
    #[arg(long, env = "POD_NAME")]
    pod_name: String,

    /// Patroni REST API address
    #[arg(long, env = "PGKEEPER_HA_URL", default_value = DEFAULT_HA_URL)]
    ha_url: String,

    /// Process supervisor API address
    #[arg(long, env = "PGKEEPER_SUPERVISOR_URL", default_value = DEFAULT_SUPERVISOR_URL)]
    supervisor_url: String,

    /// Kubeconfig path (in-cluster config when unset)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Seconds between status evaluations
    #[arg(long, env = "PGKEEPER_TICK_INTERVAL", default_value_t = 30)]
    tick_interval: u64,

    /// YAML file with database options
    #[arg(long, env = "PGKEEPER_DATABASE_CONFIG")]
    database_config: Option<PathBuf>,

    /// Host to connect to for password changes (primary Service by default)
    #[arg(long, env = "PGKEEPER_DATABASE_HOST")]
    database_host: Option<String>,

    /// Keep secrets in peer state; the platform has no native secret storage
    #[arg(long, env = "PGKEEPER_LEGACY_SECRETS")]
    legacy_secrets: bool,

    /// Log output format
    #[arg(long, env = "PGKEEPER_LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the member event loop (default)
    Run,

    /// Print a system user's password
    GetPassword {
        /// operator, replication, rewind or monitoring (default operator)
        #[arg(long)]
        username: Option<String>,
    },

    /// Change a system user's password; only accepted on the leader
    SetPassword {
        /// operator, replication, rewind or monitoring (default operator)
        #[arg(long)]
        username: Option<String>,

        /// New password; a random one is generated when omitted
        #[arg(long, env = "PGKEEPER_NEW_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Print the member currently acting as primary
    GetPrimary,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, ValueEnum)]
enum LogFormatArg {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..TelemetryConfig::default()
    })?;

    let identity =
        ClusterIdentity::from_pod_name(cli.app.clone(), cli.namespace.clone(), &cli.pod_name)?;
    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let database_config = match &cli.database_config {
        Some(path) => DatabaseConfig::from_file(path)?,
        None => DatabaseConfig::default(),
    };
    let render = RenderParams {
        parameters: database_config.build_parameters()?,
    };

    let elector = Arc::new(LeaderElector::new(client.clone(), &identity));

    let mut builder = Context::builder(identity.clone())
        .client(client)
        .legacy_secrets(cli.legacy_secrets)
        .ha_url(cli.ha_url.clone())
        .supervisor_url(cli.supervisor_url.clone())
        .render(render)
        .leader_flag(elector.leader_flag());
    if let Some(host) = &cli.database_host {
        builder = builder.database_host(host.clone());
    }
    let ctx = Arc::new(builder.build()?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            Runtime::new(ctx, elector, Duration::from_secs(cli.tick_interval))
                .run()
                .await
        }
        Commands::GetPassword { username } => {
            let password = ctx.actions().get_password(username.as_deref()).await?;
            println!("{}", json!({ "password": password }));
            Ok(())
        }
        Commands::SetPassword { username, password } => {
            let holder = elector.current_holder().await?;
            let is_leader = holder.as_deref() == Some(identity.member_name().as_str());
            ctx.actions()
                .set_password(is_leader, username.as_deref(), password.as_deref())
                .await?;
            println!("{}", json!({ "result": "password updated" }));
            Ok(())
        }
        Commands::GetPrimary => {
            let primary = ctx.actions().get_primary().await?;
            println!("{}", json!({ "primary": primary }));
            Ok(())
        }
    }
}
