//! Pool Broker
//!
//! One binary for every role:
//! - `broker`: serves the runtime protocol over a backend store
//! - `poollet`: drives one pool's runtime from the front store
//! - `scheduler`: places requests on pools
//! - `create`, `list`, `delete`, `expand`, `status`: runtime protocol client

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pool_broker::api;
use pool_broker::broker::Broker;
use pool_broker::classes::{RuntimeClassSource, StoreClassSource};
use pool_broker::crd::all_crds;
use pool_broker::domain::ports::{ListFilter, PoolTarget, RuntimeMetadata, RuntimeSpec};
use pool_broker::store::{parse_selector, EventSinkRef, MemoryStoreConfig};
use pool_broker::{
    Bucket, ClassMapper, Controller, EventRelay, KubeStore, MemoryStore, Metrics, PoolResource,
    PoolScheduler, PoolStatusReconciler, RandomSelection, Registry, RemoteRuntime, ResourceKind,
    ResourceReconciler, ResourceStoreRef, Runtime, RuntimeObject, RuntimeRef, Settings, TypedStore,
    Volume, Workload,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Pool Broker - pool-scoped control plane for workloads, volumes and buckets
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// YAML settings file
    #[arg(long, env = "POOL_BROKER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

/// Flags shared by the long-running roles
#[derive(Args, Debug)]
struct ServeArgs {
    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Run in standalone mode (in-memory store, no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

/// Flags shared by the client commands
#[derive(Args, Debug)]
struct ClientArgs {
    /// Runtime API base URL
    #[arg(long, env = "RUNTIME_URL", default_value = "http://localhost:8090")]
    url: String,

    /// Resource kind served at the URL
    #[arg(long, env = "RUNTIME_KIND", default_value = "volume")]
    kind: ResourceKind,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,
}

impl ClientArgs {
    fn connect(&self) -> Result<RemoteRuntime> {
        RemoteRuntime::new(&self.url, self.kind, Duration::from_secs(self.timeout_secs))
            .context("build runtime client")
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the runtime protocol for one kind over a backend store
    Broker {
        #[command(flatten)]
        serve: ServeArgs,

        /// Kind to serve
        #[arg(long, env = "RUNTIME_KIND")]
        kind: ResourceKind,

        /// REST API bind address, overriding the settings file
        #[arg(long, env = "API_ADDR")]
        api_addr: Option<SocketAddr>,
    },

    /// Run the front-side controllers of one pool
    Poollet {
        #[command(flatten)]
        serve: ServeArgs,

        #[command(flatten)]
        runtime: ClientArgs,

        /// Pool name, overriding the settings file
        #[arg(long, env = "POOL_NAME")]
        pool_name: Option<String>,
    },

    /// Place unscheduled requests of every kind on pools
    Scheduler {
        #[command(flatten)]
        serve: ServeArgs,
    },

    /// Print all CRDs as YAML
    PrintCrd,

    /// Create a runtime object
    Create {
        #[command(flatten)]
        client: ClientArgs,

        /// Class name
        #[arg(long)]
        class: String,

        /// Expected class capability, `name=value`
        #[arg(long = "capability", value_parser = parse_quantity)]
        capabilities: Vec<(String, i64)>,

        /// Requested resource, `name=value`
        #[arg(long = "resource", value_parser = parse_quantity)]
        resources: Vec<(String, i64)>,

        /// Label, `key=value`
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,

        /// Boot image (workloads only)
        #[arg(long)]
        image: Option<String>,
    },

    /// List runtime objects
    List {
        #[command(flatten)]
        client: ClientArgs,

        /// Exact id
        #[arg(long)]
        id: Option<String>,

        /// Label selector, `k=v,k2=v2`
        #[arg(short = 'l', long)]
        selector: Option<String>,
    },

    /// Delete runtime objects
    Delete {
        #[command(flatten)]
        client: ClientArgs,

        /// Ids to delete
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Replace the resources of a runtime object
    Expand {
        #[command(flatten)]
        client: ClientArgs,

        id: String,

        /// Resource, `name=value`
        #[arg(long = "resource", value_parser = parse_quantity, required = true)]
        resources: Vec<(String, i64)>,
    },

    /// Per-class capacity of the runtime's pools
    Status {
        #[command(flatten)]
        client: ClientArgs,

        /// Pool names
        #[arg(long = "pool")]
        pools: Vec<String>,

        /// Pool label selector, `k=v,k2=v2`
        #[arg(short = 'l', long)]
        selector: Option<String>,
    },
}

fn parse_quantity(s: &str) -> std::result::Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid quantity '{}': {}", value, e))?;
    Ok((name.trim().to_string(), value))
}

fn parse_label(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli);

    match cli.command {
        Command::Broker {
            serve,
            kind,
            api_addr,
        } => {
            let mut settings = Settings::load(cli.config.as_deref())?;
            if let Some(addr) = api_addr {
                settings.api.addr = addr;
            }
            run_broker(settings, serve, kind).await
        }
        Command::Poollet {
            serve,
            runtime,
            pool_name,
        } => {
            let mut settings = Settings::load(cli.config.as_deref())?;
            if let Some(pool_name) = pool_name {
                settings.poollet.pool_name = pool_name;
            }
            run_poollet(settings, serve, runtime).await
        }
        Command::Scheduler { serve } => {
            let settings = Settings::load(cli.config.as_deref())?;
            run_scheduler(settings, serve).await
        }
        Command::PrintCrd => {
            for crd in all_crds() {
                print!("---\n{}", serde_yaml::to_string(&crd)?);
            }
            Ok(())
        }
        Command::Create {
            client,
            class,
            capabilities,
            resources,
            labels,
            image,
        } => {
            let runtime = client.connect()?;
            let object = RuntimeObject {
                metadata: RuntimeMetadata {
                    labels: labels.into_iter().collect(),
                    ..Default::default()
                },
                spec: RuntimeSpec {
                    class,
                    class_capabilities: capabilities.into_iter().collect(),
                    resources: resources.into_iter().collect(),
                    image,
                    secret_data: None,
                },
                ..Default::default()
            };
            let created = runtime.create(object).await.context("create")?;
            println!("{} created", created.metadata.id);
            Ok(())
        }
        Command::List {
            client,
            id,
            selector,
        } => {
            let runtime = client.connect()?;
            let filter = ListFilter {
                id,
                label_selector: parse_selector(selector.as_deref().unwrap_or_default())?,
            };
            let objects = runtime.list(&filter).await.context("list")?;
            println!("{:<64} {:<16} {:<10} RESOURCES", "ID", "CLASS", "STATE");
            for object in objects {
                println!(
                    "{:<64} {:<16} {:<10} {}",
                    object.metadata.id,
                    object.spec.class,
                    object.status.state,
                    format_quantities(&object.spec.resources)
                );
            }
            Ok(())
        }
        Command::Delete { client, ids } => {
            let runtime = client.connect()?;
            for id in ids {
                match runtime.delete(&id).await {
                    Ok(()) => println!("{} deleted", id),
                    Err(e) if e.is_not_found() => println!("{} not found", id),
                    Err(e) => return Err(e).with_context(|| format!("delete {}", id)),
                }
            }
            Ok(())
        }
        Command::Expand {
            client,
            id,
            resources,
        } => {
            let runtime = client.connect()?;
            runtime
                .update_resources(&id, resources.into_iter().collect())
                .await
                .with_context(|| format!("expand {}", id))?;
            println!("{} expanded", id);
            Ok(())
        }
        Command::Status {
            client,
            pools,
            selector,
        } => {
            let runtime = client.connect()?;
            let target = PoolTarget {
                names: pools,
                selector: parse_selector(selector.as_deref().unwrap_or_default())?,
            };
            let rows = runtime.status(&target).await.context("status")?;
            println!("{:<24} {:>10} CAPABILITIES", "CLASS", "QUANTITY");
            for row in rows {
                println!(
                    "{:<24} {:>10} {}",
                    row.class.name,
                    row.quantity,
                    format_quantities(&row.class.capabilities)
                );
            }
            Ok(())
        }
    }
}

fn format_quantities(quantities: &BTreeMap<String, i64>) -> String {
    quantities
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Roles
// =============================================================================

async fn run_broker(settings: Settings, serve: ServeArgs, kind: ResourceKind) -> Result<()> {
    info!("Starting Pool Broker - broker");
    info!("  Version: {}", pool_broker::VERSION);
    info!("  Kind: {}", kind);
    info!("  REST API: {}", settings.api.addr);
    info!("  Standalone mode: {}", serve.standalone);

    let shutdown = shutdown_on_signal();
    let metrics = Arc::new(Metrics::new()?);
    let ready = spawn_servers(&serve, metrics.clone());

    let registry = Arc::new(Registry::with_defaults());
    let (store, events) = open_store(&serve, &settings.memory_store, registry.clone(), &settings.broker.manager, &[], &shutdown).await?;
    let typed = TypedStore::new(store, registry);

    let source = Arc::new(StoreClassSource::new(typed.clone(), kind));
    let mapper = Arc::new(ClassMapper::new(kind, source, settings.class_mapper.clone()));
    tokio::spawn(mapper.clone().run(shutdown.clone()));

    let config = settings.broker.clone();
    let runtime: RuntimeRef = match kind {
        ResourceKind::Volume => Arc::new(Broker::<Volume>::new(config, typed, events, mapper).with_metrics(metrics)),
        ResourceKind::Bucket => Arc::new(Broker::<Bucket>::new(config, typed, events, mapper).with_metrics(metrics)),
        ResourceKind::Workload => {
            Arc::new(Broker::<Workload>::new(config, typed, events, mapper).with_metrics(metrics))
        }
    };

    ready.store(true, Ordering::SeqCst);
    api::serve(&settings.api, runtime, shutdown).await?;

    info!("Broker shutdown complete");
    Ok(())
}

async fn run_poollet(settings: Settings, serve: ServeArgs, client: ClientArgs) -> Result<()> {
    let kind = client.kind;
    info!("Starting Pool Broker - poollet");
    info!("  Version: {}", pool_broker::VERSION);
    info!("  Pool: {}", settings.poollet.pool_name);
    info!("  Runtime: {} ({})", client.url, kind);
    info!("  Standalone mode: {}", serve.standalone);

    let shutdown = shutdown_on_signal();
    let metrics = Arc::new(Metrics::new()?);
    let ready = spawn_servers(&serve, metrics.clone());

    let registry = Arc::new(Registry::with_defaults());
    let watched = [kind_name(kind)];
    let controller = format!("{}-poollet", settings.poollet.pool_name);
    let (store, events) = open_store(&serve, &settings.memory_store, registry.clone(), &controller, &watched, &shutdown).await?;
    let typed = TypedStore::new(store.clone(), registry);

    let runtime: RuntimeRef = Arc::new(client.connect()?);
    let mapper = Arc::new(ClassMapper::new(
        kind,
        Arc::new(RuntimeClassSource::new(runtime.clone())),
        settings.class_mapper.clone(),
    ));
    tokio::spawn(mapper.clone().run(shutdown.clone()));

    info!("Waiting for runtime classes");
    mapper.wait_for_sync(&shutdown).await?;
    ready.store(true, Ordering::SeqCst);

    let pool = Arc::new(PoolStatusReconciler::new(
        settings.poollet.pool_name.clone(),
        typed.clone(),
        runtime.clone(),
        mapper.clone(),
        settings.poollet.status_interval,
    ));
    tokio::spawn(pool.run(shutdown.clone()));

    let parts = PoolletParts {
        settings,
        store,
        typed,
        events,
        runtime,
        mapper,
        metrics,
    };
    match kind {
        ResourceKind::Volume => run_pool_resources::<Volume>(parts, shutdown).await?,
        ResourceKind::Bucket => run_pool_resources::<Bucket>(parts, shutdown).await?,
        ResourceKind::Workload => run_pool_resources::<Workload>(parts, shutdown).await?,
    }

    info!("Poollet shutdown complete");
    Ok(())
}

struct PoolletParts {
    settings: Settings,
    store: ResourceStoreRef,
    typed: TypedStore,
    events: EventSinkRef,
    runtime: RuntimeRef,
    mapper: Arc<ClassMapper>,
    metrics: Arc<Metrics>,
}

/// Event relay plus the resource controller for one kind
async fn run_pool_resources<K: PoolResource>(parts: PoolletParts, shutdown: CancellationToken) -> Result<()> {
    let relay = Arc::new(
        EventRelay::<K>::new(parts.runtime.clone(), parts.events.clone(), parts.settings.event_relay.clone())
            .with_metrics(parts.metrics.clone()),
    );
    tokio::spawn(relay.run(shutdown.clone()));

    let class_changes = parts.mapper.subscribe_changes();
    let reconciler = Arc::new(ResourceReconciler::<K>::new(
        &parts.settings.poollet,
        parts.typed,
        parts.events,
        parts.runtime,
        parts.mapper,
    ));
    Controller::new(reconciler, parts.store)
        .with_config(parts.settings.poollet.controller.clone())
        .with_relist_trigger(class_changes)
        .with_metrics(parts.metrics)
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_scheduler(settings: Settings, serve: ServeArgs) -> Result<()> {
    info!("Starting Pool Broker - scheduler");
    info!("  Version: {}", pool_broker::VERSION);
    info!("  Standalone mode: {}", serve.standalone);

    let shutdown = shutdown_on_signal();
    let metrics = Arc::new(Metrics::new()?);
    let ready = spawn_servers(&serve, metrics.clone());

    let registry = Arc::new(Registry::with_defaults());
    let watched = ["ResourcePool", "Volume", "Bucket", "Workload"];
    let (store, events) = open_store(&serve, &settings.memory_store, registry.clone(), "pool-scheduler", &watched, &shutdown).await?;
    let typed = TypedStore::new(store.clone(), registry);
    let config = &settings.scheduler;

    macro_rules! scheduler {
        ($kind:ty) => {
            Controller::new(
                Arc::new(
                    PoolScheduler::<$kind>::new(typed.clone(), events.clone(), Arc::new(RandomSelection::new()))
                        .with_namespace(config.namespace.clone()),
                ),
                store.clone(),
            )
            .with_config(config.controller.clone())
            .with_metrics(metrics.clone())
            .run(shutdown.clone())
        };
    }

    ready.store(true, Ordering::SeqCst);
    tokio::try_join!(scheduler!(Volume), scheduler!(Bucket), scheduler!(Workload))?;

    info!("Scheduler shutdown complete");
    Ok(())
}

fn kind_name(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Volume => "Volume",
        ResourceKind::Bucket => "Bucket",
        ResourceKind::Workload => "Workload",
    }
}

/// In-memory store when standalone, the cluster otherwise
async fn open_store(
    serve: &ServeArgs,
    memory: &MemoryStoreConfig,
    registry: Arc<Registry>,
    controller: &str,
    watched: &[&str],
    shutdown: &CancellationToken,
) -> Result<(ResourceStoreRef, EventSinkRef)> {
    if serve.standalone {
        info!("Using in-memory store");
        let memory = Arc::new(MemoryStore::with_config(memory));
        let store: ResourceStoreRef = memory.clone();
        let events: EventSinkRef = memory;
        return Ok((store, events));
    }
    let kube = Arc::new(
        KubeStore::try_default(registry, controller)
            .await
            .context("connect to Kubernetes")?,
    );
    kube.start_watches(watched.iter().copied(), shutdown.clone())?;
    let store: ResourceStoreRef = kube.clone();
    let events: EventSinkRef = kube;
    Ok((store, events))
}

/// Token cancelled on Ctrl-C
fn shutdown_on_signal() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        token.cancel();
    });
    shutdown
}

/// Start the health and metrics servers; the returned flag drives `/readyz`
fn spawn_servers(serve: &ServeArgs, metrics: Arc<Metrics>) -> Arc<AtomicBool> {
    let ready = Arc::new(AtomicBool::new(false));

    let health_addr = serve.health_addr;
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = serve.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    ready
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info", "axum=info", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // stdout belongs to client command output
    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" if ready => (StatusCode::OK, "ok"),
                        "/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .context("bind health server")?
        .serve(make_svc)
        .await
        .context("health server")?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = Response::new(Body::from(buffer));
                                response
                                    .headers_mut()
                                    .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
                                response
                            }
                            Err(e) => {
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        },
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .context("bind metrics server")?
        .serve(make_svc)
        .await
        .context("metrics server")?;

    Ok(())
}
