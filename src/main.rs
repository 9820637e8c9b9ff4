use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use guardsync::config::{GuardsyncConfig, LogFormat, LoggingConfig};
use guardsync::projection::{FieldFilter, Projector, SortSpec, ViewState};
use guardsync::source::http::{build_client, extract_items, HttpWriteEndpoint};
use guardsync::writes::WriteEvent;
use guardsync::{FeedState, FieldGroup, IdentityKey, Session, Snapshot, WriteCoordinator};

#[derive(Parser)]
#[command(
    name = "guardsync",
    about = "Keep local views of a security backend in sync",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $GUARDSYNC_CONFIG, then ./guardsync.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll a stream and print the projected page on every change
    Watch {
        /// Configured stream name
        #[arg(long)]
        stream: String,

        #[command(flatten)]
        view: ViewArgs,
    },

    /// Project a saved response body (pure, no network)
    Project {
        /// JSON file holding an array or envelope body
        #[arg(long)]
        input: PathBuf,

        /// Identity field(s); repeat for a composite key
        #[arg(long, default_value = "id")]
        identity: Vec<String>,

        /// Fields covered by --search; repeat for several
        #[arg(long)]
        searchable: Vec<String>,

        #[command(flatten)]
        view: ViewArgs,
    },

    /// Edit a field-group optimistically and wait for the outcome
    Set {
        /// Configured field-group name
        #[arg(long)]
        group: String,

        /// `field=value` pairs; values are parsed as JSON when possible
        #[arg(required = true)]
        fields: Vec<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Clone)]
struct ViewArgs {
    /// Case-insensitive free-text search
    #[arg(long, default_value = "")]
    search: String,

    /// Exact-match filter `field=value`; repeat to AND several
    #[arg(long)]
    filter: Vec<FieldFilter>,

    /// `field`, `field:asc`, `field:desc` or `field:rank=a,b,c`
    #[arg(long)]
    sort: Option<SortSpec>,

    /// Rows per page (0 shows everything)
    #[arg(long, default_value = "0")]
    page_size: usize,

    /// Zero-based page index
    #[arg(long, default_value = "0")]
    page: usize,
}

impl From<ViewArgs> for ViewState {
    fn from(args: ViewArgs) -> Self {
        Self {
            search: args.search,
            filters: args.filter,
            sort: args.sort,
            page_size: args.page_size,
            page: args.page,
        }
    }
}

fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Load configuration with a plain stderr subscriber in scope, so fallback
/// warnings are visible before the configured subscriber exists.
fn load_config(path: Option<&Path>) -> Result<GuardsyncConfig> {
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn"))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(bootstrap, || match path {
        Some(path) => GuardsyncConfig::load(path),
        None => Ok(GuardsyncConfig::load_or_default()),
    })
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = env_filter(&logging.level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Watch { stream, view } => watch(&config, stream, view.into()).await?,
        Commands::Project {
            input,
            identity,
            searchable,
            view,
        } => project(&input, &identity, searchable, &view.into())?,
        Commands::Set { group, fields } => set(&config, FieldGroup::new(group), &fields).await?,
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            print!("{rendered}");
        }
    }

    Ok(())
}

async fn watch(config: &GuardsyncConfig, stream: String, view: ViewState) -> Result<()> {
    let session = Session::start(config, std::slice::from_ref(&stream))?;
    let feed = session
        .feed(&stream)
        .with_context(|| format!("stream '{stream}' did not start"))?;
    let mut updates = feed.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                render(&stream, &state, feed.projector(), &view);
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

fn render(stream: &str, state: &FeedState, projector: &Projector, view: &ViewState) {
    let Some(snapshot) = state.snapshot.as_deref() else {
        return;
    };
    let projection = projector.project(snapshot, view);

    let status = match &snapshot.error {
        Some(error) => format!(" (stale: {error})"),
        None => String::new(),
    };
    println!(
        "\n[{stream}] #{} {}  {}/{} matched  page {}/{}{status}",
        snapshot.sequence,
        snapshot.fetched_at.format("%H:%M:%S"),
        projection.matched,
        projection.total,
        projection.page + 1,
        projection.page_count.max(1),
    );
    for row in &projection.rows {
        let marker = if state.is_highlighted(&row.identity) { "*" } else { " " };
        println!("{marker} {:<20} {}", row.identity.as_str(), row.payload);
    }
}

fn project(
    input: &Path,
    identity: &[String],
    searchable: Vec<String>,
    view: &ViewState,
) -> Result<()> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let body: Value = serde_json::from_str(&content)
        .with_context(|| format!("{} is not JSON", input.display()))?;
    let key = IdentityKey::from_fields(identity).context("at least one --identity is required")?;

    let records = extract_items(body, None)?;
    let snapshot = Snapshot::from_records(1, records, &key, None, Utc::now())?;
    let projection = Projector::new(searchable).project(&snapshot, view);

    println!("{}", serde_json::to_string_pretty(&projection)?);
    Ok(())
}

async fn set(config: &GuardsyncConfig, group: FieldGroup, pairs: &[String]) -> Result<()> {
    if !config.field_groups.iter().any(|g| g.name == group.as_str()) {
        bail!("unknown field group '{group}'");
    }

    let mut fields = serde_json::Map::new();
    for pair in pairs {
        let (field, raw) = pair
            .split_once('=')
            .with_context(|| format!("expected field=value, got '{pair}'"))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        fields.insert(field.trim().to_string(), value);
    }

    let client = build_client(&config.backend)?;
    let endpoint = HttpWriteEndpoint::from_config(client, &config.backend, &config.field_groups);
    let writes = WriteCoordinator::new(Arc::new(endpoint), config.write_options());
    let mut events = writes.subscribe();

    if let Err(e) = writes.load(&group).await {
        tracing::warn!(%group, error = %e, "could not read current value");
    }
    let write_id = writes.edit(&group, Value::Object(fields)).await;

    let timeout = Duration::from_millis(config.writes.debounce_ms + config.backend.request_timeout_ms)
        + Duration::from_secs(1);
    let outcome = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(WriteEvent::Confirmed { write_id: id, value, .. }) if id == write_id => {
                    return Ok(value);
                }
                Ok(WriteEvent::Failed { notice, .. }) if notice.write_id == write_id => {
                    return Err(anyhow::anyhow!(notice.message));
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow::anyhow!("write events closed: {e}")),
            }
        }
    })
    .await
    .context("timed out waiting for the backend");

    writes.shutdown();
    let value = outcome??;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
