//! azmond — the azmon daemon.
//!
//! Serves Azure Monitor metrics to Prometheus through probe endpoints.
//! Credentials come from the environment: either `AZURE_ACCESS_TOKEN`, or
//! `AZURE_TENANT_ID`, `AZURE_CLIENT_ID` and `AZURE_CLIENT_SECRET` for the
//! client-credentials flow.
//!
//! # Usage
//!
//! ```text
//! azmond --server.bind :8080 --enable-caching --azure.resource-tag "owner team"
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use azmon_client::{ArmClient, AzureEnvironment, ClientSecretCredential, MetricsClient, StaticToken, TokenSource};
use azmon_core::{CacheConfig, ConcurrencyConfig, ProberConfig, RetryConfig, TemplateConfig, parse_duration};
use azmon_metrics::ProbeMetrics;
use azmon_prober::Prober;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod server;

#[derive(Parser, Debug)]
#[command(name = "azmond", about = "Azure Monitor metrics bridge for Prometheus")]
struct Cli {
    /// Address to listen on; `:port` binds every interface.
    #[arg(long = "server.bind", env = "SERVER_BIND", default_value = ":8080")]
    server_bind: String,

    /// Time allowed for a client to send request headers.
    #[arg(long = "server.timeout.read", env = "SERVER_TIMEOUT_READ", default_value = "5s", value_parser = duration_arg)]
    read_timeout: Duration,

    /// Server write timeout; also the upper bound on a probe request.
    #[arg(long = "server.timeout.write", env = "SERVER_TIMEOUT_WRITE", default_value = "10s", value_parser = duration_arg)]
    write_timeout: Duration,

    /// Shorthand for `--log.level debug`.
    #[arg(long = "log.debug", env = "LOG_DEBUG")]
    log_debug: bool,

    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long = "log.json", env = "LOG_JSON")]
    log_json: bool,

    /// Development logging: plain text with source file and line. Overrides `--log.json`.
    #[arg(long = "log.devel", env = "LOG_DEVEL")]
    log_devel: bool,

    /// Subscriptions processed concurrently.
    #[arg(long = "concurrency.subscription", env = "CONCURRENCY_SUBSCRIPTION", default_value_t = 5)]
    concurrency_subscription: usize,

    /// Resources fetched concurrently per subscription.
    #[arg(
        long = "concurrency.subscription.resource",
        env = "CONCURRENCY_SUBSCRIPTION_RESOURCE",
        default_value_t = 10
    )]
    concurrency_resource: usize,

    /// Cache remote responses.
    #[arg(long = "enable-caching", env = "ENABLE_CACHING")]
    enable_caching: bool,

    /// Default lifetime of cached responses.
    #[arg(long = "cache.ttl", env = "CACHE_TTL", default_value = "1m", value_parser = duration_arg)]
    cache_ttl: Duration,

    /// Lifetime of cached target listings (service discovery).
    #[arg(
        long = "azure.servicediscovery.cache",
        env = "AZURE_SERVICEDISCOVERY_CACHE",
        default_value = "30m",
        value_parser = duration_arg
    )]
    discovery_cache_ttl: Duration,

    /// Upper bound on entries per cache.
    #[arg(long = "cache.max-entries", env = "CACHE_MAX_ENTRIES", default_value_t = 10_000)]
    cache_max_entries: usize,

    /// Resource tags added as `tag_<key>` labels (space separated).
    #[arg(
        long = "azure.resource-tag",
        env = "AZURE_RESOURCE_TAG",
        default_value = "owner",
        value_delimiter = ' '
    )]
    resource_tags: Vec<String>,

    /// Metric name template.
    #[arg(long = "metrics.template", env = "METRIC_TEMPLATE", default_value = "{name}")]
    metric_template: String,

    /// Metric help template.
    #[arg(long = "metrics.help", env = "METRIC_HELP", default_value = "Azure monitor insight metric")]
    metric_help: String,

    /// Lowercase dimension values.
    #[arg(long = "metrics.dimensions.lowercase", env = "METRIC_DIMENSIONS_LOWERCASE")]
    lowercase_dimensions: bool,

    /// Azure cloud: AZUREPUBLICCLOUD, AZURECHINACLOUD or AZUREUSGOVERNMENTCLOUD.
    #[arg(long = "azure-environment", env = "AZURE_ENVIRONMENT", default_value = "AZUREPUBLICCLOUD")]
    azure_environment: String,

    /// Token audience for Microsoft Entra ID; defaults to the environment's resource manager.
    #[arg(long = "azure-ad-resource-url", env = "AZURE_AD_RESOURCE")]
    ad_resource_url: Option<String>,

    /// Attempts per metric fetch, including the first.
    #[arg(long = "retry.attempts", env = "RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    /// Initial retry backoff.
    #[arg(long = "retry.backoff", env = "RETRY_BACKOFF", default_value = "500ms", value_parser = duration_arg)]
    retry_backoff: Duration,

    /// Maximum retry backoff.
    #[arg(long = "retry.backoff.max", env = "RETRY_BACKOFF_MAX", default_value = "10s", value_parser = duration_arg)]
    retry_backoff_max: Duration,
}

impl Cli {
    fn prober_config(&self) -> ProberConfig {
        ProberConfig {
            concurrency: ConcurrencyConfig {
                subscriptions: self.concurrency_subscription,
                resources_per_subscription: self.concurrency_resource,
            },
            cache: CacheConfig {
                enabled: self.enable_caching,
                ttl: self.cache_ttl,
                resolution_ttl: self.discovery_cache_ttl,
                max_entries: self.cache_max_entries,
            },
            retry: RetryConfig {
                max_attempts: self.retry_attempts,
                base_delay: self.retry_backoff,
                max_delay: self.retry_backoff_max,
            },
            templates: TemplateConfig {
                name_template: self.metric_template.clone(),
                help_template: self.metric_help.clone(),
                lowercase_dimensions: self.lowercase_dimensions,
            },
            resource_tags: self
                .resource_tags
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            request_timeout: self.write_timeout,
        }
    }

    /// Audience requested for client-credential tokens.
    fn token_resource<'a>(&'a self, environment: &AzureEnvironment) -> &'a str {
        match self.ad_resource_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url,
            _ => environment.resource_manager,
        }
    }

    fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let bind = self.server_bind.trim();
        let full = match bind.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => bind.to_string(),
        };
        full.parse()
            .with_context(|| format!("invalid --server.bind address {bind:?}"))
    }
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration {s:?} (expected e.g. 500ms, 5s, 1m)"))
}

fn init_tracing(cli: &Cli) {
    let level = if cli.log_debug { "debug" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},hyper=info,reqwest=info")));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_devel {
        builder.with_file(true).with_line_number(true).init();
    } else if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Build the ARM client from the environment's credentials.
fn build_client(cli: &Cli) -> anyhow::Result<Arc<dyn MetricsClient>> {
    let environment = AzureEnvironment::from_name(&cli.azure_environment)
        .ok_or_else(|| anyhow!("unknown azure environment {:?}", cli.azure_environment))?;
    let http = reqwest::Client::builder()
        .timeout(cli.write_timeout)
        .build()
        .context("building HTTP client")?;

    let tokens: Arc<dyn TokenSource> = match std::env::var("AZURE_ACCESS_TOKEN") {
        Ok(token) if !token.is_empty() => {
            info!("using static access token");
            Arc::new(StaticToken::new(token))
        }
        _ => {
            let tenant = env_var("AZURE_TENANT_ID")?;
            let client_id = env_var("AZURE_CLIENT_ID")?;
            let secret = env_var("AZURE_CLIENT_SECRET")?;
            info!(tenant = %tenant, client_id = %client_id, "using client secret credential");
            Arc::new(ClientSecretCredential::new(
                http.clone(),
                environment.authority,
                &tenant,
                client_id,
                secret,
                cli.token_resource(&environment),
            ))
        }
    };

    info!(environment = environment.name, "azure environment selected");
    Ok(Arc::new(ArmClient::new(http, environment, tokens)))
}

fn env_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{name} must be set when AZURE_ACCESS_TOKEN is not"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "azmond starting");

    let config = cli.prober_config();
    info!(config = %config.to_json(), "effective configuration");
    info!(
        read_timeout_ms = cli.read_timeout.as_millis() as u64,
        write_timeout_ms = cli.write_timeout.as_millis() as u64,
        "server timeouts"
    );
    if config.cache.enabled {
        info!(ttl_secs = config.cache.ttl.as_secs(), "response caching enabled");
    } else {
        warn!("response caching disabled; every probe calls the remote API");
    }

    let client = build_client(&cli)?;
    let prober = Arc::new(Prober::new(client, config, Arc::new(ProbeMetrics::new())));
    let router = azmon_api::build_router(prober);

    let addr = cli.bind_addr()?;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    server::serve(listener, router, cli.read_timeout, cli.write_timeout, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await;

    info!("azmond stopped");
    Ok(())
}
