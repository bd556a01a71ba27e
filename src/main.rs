use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use open_commander::api;
use open_commander::auth::{ApiKeys, AuthConfig, AuthResolver};
use open_commander::broadcast::BroadcasterRegistry;
use open_commander::container::{CliDriver, ContainerDriver, RuntimeType};
use open_commander::db;
use open_commander::forwarder::{self, ForwarderConfig};
use open_commander::git::GitWorkspace;
use open_commander::github::GithubClient;
use open_commander::ingress::ContainerIngressCleanup;
use open_commander::mounts::{MountPlanner, MountPlannerConfig};
use open_commander::presence::PresenceTracker;
use open_commander::project::ProjectRepository;
use open_commander::proxy::{self, ProxyState};
use open_commander::session::{SessionRepository, SessionService, SessionServiceConfig};
use open_commander::tasks::{InProcessQueue, TaskRepository};
use open_commander::user::UserRepository;

const APP_NAME: &str = "commander";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Open Commander - terminal session broker for agent containers.",
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
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the front door, HTTP API and WebSocket proxy
    Serve(ServeCommand),
    /// Create config directories and a default config file
    Init(InitCommand),
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
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Public front-door port
    #[arg(long, default_value = "3000")]
    front_port: u16,
    /// Internal HTTP application port
    #[arg(long, default_value = "3001")]
    http_port: u16,
    /// WebSocket proxy port
    #[arg(long, default_value = "7682")]
    proxy_port: u16,
    /// Agent container image
    #[arg(long)]
    image: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("open_commander={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.config.paths.data_dir,
            &self.config.paths.state_root,
            &self.config.paths.workspace_root,
        ] {
            let expanded = expand_path(dir)?;
            fs::create_dir_all(&expanded)
                .with_context(|| format!("creating directory {}", expanded.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                if path.is_dir() {
                    path.join("config.toml")
                } else {
                    path
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self { config_file })
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    let home = env::var_os("HOME").ok_or_else(|| anyhow!("HOME is not set"))?;
    Ok(PathBuf::from(home).join(".config").join(APP_NAME))
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .map_err(|e| anyhow!("expanding path '{raw}': {e}"))?
        .into_owned();
    Ok(PathBuf::from(expanded))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    server: ServerConfig,
    container: ContainerConfig,
    paths: PathsConfig,
    auth: AuthConfig,
    api: ApiConfig,
    github: GithubConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            container: ContainerConfig::default(),
            paths: PathsConfig::default(),
            auth: AuthConfig::default(),
            api: ApiConfig::default(),
            github: GithubConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    front_port: u16,
    http_port: u16,
    proxy_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            front_port: 3000,
            http_port: 3001,
            proxy_port: 7682,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    binary: Option<String>,
    /// Agent container image
    image: String,
    /// Agent-internal network name
    network: String,
    /// Port the in-container terminal daemon listens on
    terminal_port: u16,
    /// Terminal daemon argv inside the container
    terminal_argv: Vec<String>,
    /// Egress proxy URL for agent traffic
    egress_proxy_url: String,
    /// Inner container daemon address for agents
    docker_host: String,
    /// Extra host:ip entries for agent containers
    extra_hosts: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "open-commander/agent:latest".to_string(),
            network: "oc-agents".to_string(),
            terminal_port: 7681,
            terminal_argv: vec![
                "ttyd".to_string(),
                "-W".to_string(),
                "-p".to_string(),
                "7681".to_string(),
                "tmux".to_string(),
                "new".to_string(),
                "-A".to_string(),
                "-s".to_string(),
                "main".to_string(),
            ],
            egress_proxy_url: "http://oc-egress:3128".to_string(),
            docker_host: "tcp://oc-dind:2376".to_string(),
            extra_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: String,
    state_root: String,
    workspace_root: String,
    certs_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.local/share/commander".to_string(),
            state_root: "~/.local/share/commander/state".to_string(),
            workspace_root: "~/.local/share/commander/workspaces".to_string(),
            certs_path: "~/.local/share/commander/certs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ApiConfig {
    /// Bearer keys accepted on the task delegation surface.
    keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct GithubConfig {
    token: Option<String>,
}

fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if paths.config_file.exists() {
        builder = builder.add_source(
            File::from(paths.config_file.clone()).format(FileFormat::Toml),
        );
    }

    let config = builder
        .add_source(Environment::with_prefix("OC").separator("__"))
        .build()
        .context("building configuration")?;

    config
        .try_deserialize()
        .context("deserializing configuration")
}

const DEFAULT_CONFIG: &str = r#"# Open Commander configuration.

[logging]
level = "info"

[server]
host = "0.0.0.0"
front_port = 3000
http_port = 3001
proxy_port = 7682

[container]
image = "open-commander/agent:latest"
network = "oc-agents"
terminal_port = 7681
egress_proxy_url = "http://oc-egress:3128"
docker_host = "tcp://oc-dind:2376"

[paths]
data_dir = "~/.local/share/commander"
state_root = "~/.local/share/commander/state"
workspace_root = "~/.local/share/commander/workspaces"
certs_path = "~/.local/share/commander/certs"

[auth]
disabled = false
# jwt_secret = "change-me"
cookie_name = "auth_token"

[api]
keys = []

[github]
# token = "ghp_..."
"#;

fn write_default_config(path: &PathBuf) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("writing default config to {}", path.display()))?;
    info!("wrote default config to {}", path.display());
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("starting Open Commander...");

    let data_dir = expand_path(&ctx.config.paths.data_dir)?;
    let database = db::Database::open(&data_dir).await?;

    let driver: Arc<CliDriver> = {
        let driver = match (&ctx.config.container.runtime, &ctx.config.container.binary) {
            (Some(rt), Some(binary)) => CliDriver::with_binary(*rt, binary.clone()),
            (Some(rt), None) => CliDriver::with_type(*rt),
            (None, _) => CliDriver::new(),
        };

        match driver.health_check().await {
            Ok(_) => info!("container engine ({}) is available", driver.runtime_type()),
            Err(e) => warn!(
                "container engine health check failed: {:?}; container operations may fail",
                e
            ),
        }

        Arc::new(driver)
    };
    let driver_api: Arc<dyn ContainerDriver> = driver.clone();

    let image = cmd
        .image
        .unwrap_or_else(|| ctx.config.container.image.clone());

    let planner = MountPlanner::new(MountPlannerConfig {
        state_root: expand_path(&ctx.config.paths.state_root)?,
        workspace_root: expand_path(&ctx.config.paths.workspace_root)?,
        certs_path: expand_path(&ctx.config.paths.certs_path)?,
        egress_proxy_url: ctx.config.container.egress_proxy_url.clone(),
        docker_host: ctx.config.container.docker_host.clone(),
        github_token: ctx.config.github.token.clone(),
        terminal_argv: ctx.config.container.terminal_argv.clone(),
    });

    let broadcaster = BroadcasterRegistry::new();
    let presence = PresenceTracker::new(broadcaster.clone());
    let _sweep_handle = presence.start_sweep_task();

    let session_repo = SessionRepository::new(database.pool().clone());
    let project_repo = ProjectRepository::new(database.pool().clone());
    let task_repo = TaskRepository::new(database.pool().clone());
    let user_repo = UserRepository::new(database.pool().clone());

    let ingress = Arc::new(ContainerIngressCleanup::new(
        driver_api.clone(),
        database.pool().clone(),
    ));

    let session_service = SessionService::new(
        session_repo.clone(),
        driver_api.clone(),
        planner,
        ingress,
        broadcaster.clone(),
        SessionServiceConfig {
            image,
            network: ctx.config.container.network.clone(),
            extra_hosts: ctx.config.container.extra_hosts.clone(),
        },
    );

    match session_service.startup_cleanup().await {
        Ok(0) => {}
        Ok(cleaned) => info!("startup cleanup reconciled {} stale sessions", cleaned),
        Err(e) => warn!("startup cleanup failed (continuing anyway): {:?}", e),
    }

    let auth = AuthResolver::new(ctx.config.auth.clone(), user_repo);
    if auth.is_disabled() {
        warn!("authentication is DISABLED; all connections resolve to the first admin user");
    }

    let git = GitWorkspace::new(
        expand_path(&ctx.config.paths.workspace_root)?,
        ctx.config.github.token.clone(),
    );
    let github = GithubClient::new(ctx.config.github.token.clone())?;

    let app_state = api::AppState {
        sessions: Arc::new(session_service),
        projects: project_repo.clone(),
        tasks: task_repo,
        queue: Arc::new(InProcessQueue),
        git,
        github,
        api_keys: ApiKeys::new(ctx.config.api.keys.clone()),
    };

    let proxy_state = ProxyState {
        auth,
        sessions: session_repo,
        projects: project_repo,
        presence,
        broadcaster,
        engine_binary: driver.binary().to_string(),
        terminal_port: ctx.config.container.terminal_port,
    };

    let host = cmd.host;
    let http_listener = TcpListener::bind((host.as_str(), cmd.http_port))
        .await
        .with_context(|| format!("binding HTTP app on port {}", cmd.http_port))?;
    let proxy_listener = TcpListener::bind((host.as_str(), cmd.proxy_port))
        .await
        .with_context(|| format!("binding proxy on port {}", cmd.proxy_port))?;
    let front_listener = TcpListener::bind((host.as_str(), cmd.front_port))
        .await
        .with_context(|| format!("binding front door on port {}", cmd.front_port))?;

    info!(
        "listening: front={} http={} proxy={}",
        cmd.front_port, cmd.http_port, cmd.proxy_port
    );

    let app = api::create_router(app_state);
    let http_server = async move {
        axum::serve(http_listener, app)
            .await
            .context("HTTP server")
    };

    let proxy_server = proxy::serve(proxy_listener, proxy_state);

    let forwarder_config = ForwarderConfig {
        proxy_addr: format!("127.0.0.1:{}", cmd.proxy_port),
        http_addr: format!("127.0.0.1:{}", cmd.http_port),
    };
    let front_server = forwarder::serve(front_listener, forwarder_config);

    tokio::try_join!(http_server, proxy_server, front_server)?;

    Ok(())
}
