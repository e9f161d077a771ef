use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use telehub::api::{self, AppState};
use telehub::config::{APP_NAME, AppConfig, load_config, write_default_config};
use telehub::router::MessageRouter;
use telehub::serial::{DeviceOpener, SerialLink, SerialMonitor};
use telehub::ws::{BroadcastHub, ClientRegistry};

fn main() {
    if let Err(err) = run(Cli::parse()) {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let rt = Runtime::load(cli.common)?;
    init_logging(&rt);
    debug!("Using config {}", rt.config_path.display());

    match cli.command {
        Command::Serve(cmd) => serve_blocking(rt, cmd),
        Command::Init { force } => handle_init(&rt, force),
        Command::Config { command } => handle_config(&rt, command),
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

#[tokio::main]
async fn serve_blocking(rt: Runtime, cmd: ServeCommand) -> Result<()> {
    let mut config = rt.config;
    cmd.apply(&mut config);
    handle_serve(config).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "telehub - relay between WebSocket clients and a serial controller.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Config file (or a directory holding config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// More log output (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Same as -v
    #[arg(long, global = true)]
    debug: bool,
    /// Same as -vv
    #[arg(long, global = true)]
    trace: bool,
    /// JSON logs, and JSON for `config show`
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// When to color log output
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Include targets and source locations in log lines
    #[arg(long, global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay server
    Serve(ServeCommand),
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Serial device of the controller
    #[arg(long, value_name = "PATH")]
    device: Option<String>,
    /// Serial baud rate
    #[arg(long = "baud")]
    baud_rate: Option<u32>,
}

impl ServeCommand {
    fn apply(self, config: &mut AppConfig) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(device) = self.device {
            config.serial.device = device;
        }
        if let Some(baud_rate) = self.baud_rate {
            config.serial.baud_rate = baud_rate;
        }
    }
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration (TOML, or JSON with --json)
    Show,
    /// Print the config file path
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

/// Parsed flags plus the loaded config.
struct Runtime {
    opts: CommonOpts,
    config_path: PathBuf,
    /// The config file did not exist and defaults were written on load.
    created: bool,
    config: AppConfig,
}

impl Runtime {
    fn load(opts: CommonOpts) -> Result<Self> {
        let config_path = config_path(opts.config.as_deref())?;
        let created = !config_path.exists();
        if created {
            write_default_config(&config_path)?;
        }
        let config = load_config(&config_path)?;
        Ok(Self {
            opts,
            config_path,
            created,
            config,
        })
    }

    /// Flags win over `logging.level`.
    fn log_level(&self) -> LevelFilter {
        let opts = &self.opts;
        if opts.quiet {
            return LevelFilter::Error;
        }
        match (opts.trace, opts.debug, opts.verbose) {
            (true, _, _) | (_, _, 2..) => LevelFilter::Trace,
            (_, true, _) | (_, _, 1) => LevelFilter::Debug,
            _ => self.config.logging.level.parse().unwrap_or(LevelFilter::Info),
        }
    }

    fn use_color(&self) -> bool {
        if self.opts.no_color || env::var_os("NO_COLOR").is_some() {
            return false;
        }
        match self.opts.color {
            ColorOption::Always => true,
            ColorOption::Never => false,
            ColorOption::Auto => {
                env::var_os("FORCE_COLOR").is_some() || io::stderr().is_terminal()
            }
        }
    }
}

/// `tracing` for the HTTP layer, `env_logger` for the `log` users.
fn init_logging(rt: &Runtime) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = rt.log_level();
    let name = level.as_str().to_ascii_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={name},tower_http={name}")));
    let fmt = tracing_subscriber::fmt::layer()
        .with_target(rt.opts.diagnostics)
        .with_file(rt.opts.diagnostics)
        .with_line_number(rt.opts.diagnostics);

    let registry = tracing_subscriber::registry().with(filter);
    if rt.opts.json {
        registry.with(fmt.json()).try_init().ok();
    } else {
        registry.with(fmt.with_ansi(rt.use_color())).try_init().ok();
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&name))
        .filter_level(level)
        .try_init()
        .ok();
}

fn handle_init(rt: &Runtime, force: bool) -> Result<()> {
    if !rt.created {
        if !force {
            bail!(
                "config already exists at {} (use --force to overwrite)",
                rt.config_path.display()
            );
        }
        write_default_config(&rt.config_path)?;
    }
    info!("Wrote default config to {}", rt.config_path.display());
    Ok(())
}

fn handle_config(rt: &Runtime, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = if rt.opts.json {
                serde_json::to_string_pretty(&rt.config).context("serializing config to JSON")?
            } else {
                toml::to_string_pretty(&rt.config).context("serializing config to TOML")?
            };
            println!("{rendered}");
        }
        ConfigCommand::Path => println!("{}", rt.config_path.display()),
        ConfigCommand::Reset => {
            write_default_config(&rt.config_path)?;
            info!("Reset {}", rt.config_path.display());
        }
    }
    Ok(())
}

async fn handle_serve(mut config: AppConfig) -> Result<()> {
    config.server.static_dir = expand(&config.server.static_dir)?.display().to_string();
    config.validate().context("invalid configuration")?;
    let monitor_settings = config.serial.monitor_settings()?;

    info!(
        "Serial device {} at {} baud ({:?} frames)",
        config.serial.device, config.serial.baud_rate, config.serial.frame_mode
    );

    let registry = Arc::new(ClientRegistry::new());
    let hub = BroadcastHub::new(registry, config.hub.overflow_policy);
    let (command_tx, command_rx) = mpsc::channel(config.serial.command_queue);
    let router = MessageRouter::new(hub, command_tx);

    let opener = DeviceOpener::new(config.serial.device.clone(), config.serial.baud_rate);
    let link = SerialLink::new(opener, config.serial.link_settings());
    let monitor = SerialMonitor::new(link, command_rx, router.clone(), monitor_settings);

    let state = AppState::new(router, monitor.link_state(), &config);
    let app = api::create_router(state);

    // One token stops both the monitor and the HTTP server.
    let cancel = CancellationToken::new();
    let monitor_task = tokio::spawn(monitor.run(cancel.clone()));
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Listening on http://{}", addr);

    // Frames are small and latency matters more than throughput.
    let listener = axum::serve::ListenerExt::tap_io(listener, |tcp| {
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("running server");

    cancel.cancel();
    if let Err(e) = monitor_task.await {
        warn!("Serial monitor task ended abnormally: {:?}", e);
    }

    info!("Shutdown complete");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, closing connections...");
}

/// `--config` if given (a directory means `<dir>/config.toml`), otherwise the
/// XDG config dir.
fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let Some(path) = explicit else {
        return Ok(default_config_dir()?.join("config.toml"));
    };

    let path = match path.to_str() {
        Some(text) => expand(text)?,
        None => path.to_path_buf(),
    };
    Ok(if path.is_dir() {
        path.join("config.toml")
    } else {
        path
    })
}

fn expand(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).with_context(|| format!("expanding {text}"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

fn default_config_dir() -> Result<PathBuf> {
    env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}
