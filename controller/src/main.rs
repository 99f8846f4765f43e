use std::{sync::Arc, time::Duration};

use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::*;

fn main() {
    use clap::{
        crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run controllers").args([
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
            Arg::new("workers")
                .long("workers")
                .env("KRO_WORKERS")
                .help("concurrent reconciles per registered kind")
                .default_value("8"),
            Arg::new("resync_seconds")
                .long("resync-period-seconds")
                .help("full re-list interval for every watched kind")
                .default_value("36000"),
            Arg::new("queue_max_retries")
                .long("queue-max-retries")
                .help("per-item retries before an item is dropped")
                .default_value("20"),
            Arg::new("shutdown_timeout_seconds")
                .long("shutdown-timeout-seconds")
                .help("grace given to in-flight reconciles on shutdown")
                .default_value("30"),
            Arg::new("default_requeue_seconds")
                .long("default-requeue-seconds")
                .help("wait before retrying a not-yet-ready dependency")
                .default_value("30"),
            Arg::new("allow_crd_deletion")
                .long("allow-crd-deletion")
                .help("delete a synthesized CRD when its definition is deleted")
                .action(ArgAction::SetTrue),
            Arg::new("leader_elect")
                .long("leader-elect")
                .help("Flag for if leader election is needed. Currently does nothing.")
                .hide(true)
                .action(ArgAction::SetTrue),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(e),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    _leader_elect: bool,
    introspection_address: std::net::SocketAddr,
    config: config::ControllerConfig,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = Error;

    fn try_from(m: &clap::ArgMatches) -> Result<Self> {
        let seconds = |name: &str| -> Result<Duration> {
            let raw = m.get_one::<String>(name).expect("defaulted");
            let n: u64 = raw
                .parse()
                .map_err(|_| Error::BadName(format!("{name} must be a number of seconds")))?;
            Ok(Duration::from_secs(n))
        };
        let config = config::ControllerConfig {
            workers: m
                .get_one::<String>("workers")
                .expect("defaulted")
                .parse()
                .map_err(|_| Error::BadName("workers must be a number".into()))?,
            resync_period: seconds("resync_seconds")?,
            queue_max_retries: m
                .get_one::<String>("queue_max_retries")
                .expect("defaulted")
                .parse()
                .map_err(|_| Error::BadName("queue-max-retries must be a number".into()))?,
            shutdown_timeout: seconds("shutdown_timeout_seconds")?,
            allow_crd_deletion: m.get_flag("allow_crd_deletion"),
            default_requeue_duration: seconds("default_requeue_seconds")?,
        };
        Ok(Self {
            _leader_elect: m.get_flag("leader_elect"),
            introspection_address: m
                .get_one::<String>("introspection_address")
                .expect("defaulted")
                .parse()?,
            config,
        })
    }
}

fn startup(args: Args) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    metrics::register();
    let ctlstop = token.clone();
    rt.handle().spawn({
        let token = token.clone();
        async move {
            if let Err(err) = signal::ctrl_c().await {
                error!("error reading SIGTERM: {err}");
            }
            token.cancel();
        }
    });
    rt.block_on(run(args, ctlstop))
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    use tokio::task;

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config.clone())?.build();

    info!(workers = args.config.workers, "setup done, starting controllers");
    let registry = Arc::new(registry::DynamicRegistry::new(
        client.clone(),
        args.config.clone(),
        token.clone(),
    ));
    let ctx = Arc::new(Context {
        client: client.clone(),
        kube_config: Some(config),
        config: args.config,
        schemas: Arc::new(schemas::ClusterSchemaSource::new(client)),
        registry: registry.clone(),
    });

    let mut ctrls = task::JoinSet::new();
    ctrls.spawn(rgds::controller(token.clone(), ctx)?);
    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error starting controller: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from controller: {e}");
                    token.cancel();
                }
            }
        };
    }
    registry.shutdown().await?;
    Ok(())
}
