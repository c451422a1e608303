use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{value_parser, Arg, ArgAction, Command};
use config::{Config, File as ConfigFile};
use mss_security::{generate_token_secret, hash_password, Account, Authenticator};
use mss_server::{build_router, spawn_listeners, AppState, ListenerConfig, Scheme, StatusOverride};
use mss_storage::StorageLayout;
use std::fs;
use std::io::{self, BufRead};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{git_commit_hash, MSS_VERSION};

const DEFAULT_CONFIG_FILE: &str = "mss.toml";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_IP: &str = "0.0.0.0";
const STATUS_OVERRIDE_ENV: &str = "DEBUG_MSS_HTTP_STATUS";
const STORAGE_CHECK_FILE: &str = ".mss_storage_check";

#[derive(Debug, Clone)]
struct NodeConfig {
    config_path: Option<PathBuf>,

    // Storage
    storage_location: PathBuf,

    // Network
    port: u16,
    ips: Vec<IpAddr>,
    use_https: bool,
    cert_dir: PathBuf,

    // Account
    username: String,
    password_hash: String,
    token_secret: Vec<u8>,

    // Logging
    log_level: String,
    log_format: String,

    // Debugging
    debug_http_status: Option<String>,
}

impl NodeConfig {
    fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if path.exists() {
                Some(path)
            } else {
                None
            }
        };

        let mut builder = Config::builder();

        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MSS")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ips"),
        );

        let config = builder.build()?;

        let storage_location = get_string_value(&config, &["storage_location", "storage"])
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("storage_location must be configured"))?;

        let port = match config.get_int("port") {
            Ok(port) => u16::try_from(port).map_err(|_| anyhow!("port {port} is out of range"))?,
            Err(_) => DEFAULT_PORT,
        };

        let raw_ips = config
            .get_array("ips")
            .map(|values| {
                values
                    .into_iter()
                    .filter_map(|value| value.into_string().ok())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|_| vec![DEFAULT_IP.to_string()]);

        let token_secret = get_string_value(&config, &["token_secret"])
            .ok_or_else(|| anyhow!("token_secret must be configured"))?;
        let token_secret = BASE64
            .decode(token_secret.as_bytes())
            .context("token_secret is not valid base64")?;

        let cert_dir = get_string_value(&config, &["cert_dir"])
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                resolved_path
                    .as_deref()
                    .and_then(Path::parent)
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."))
            });

        Ok(Self {
            config_path: resolved_path,
            storage_location,
            port,
            ips: parse_ips(&raw_ips),
            use_https: get_bool_value(&config, &["use_https"], false),
            cert_dir,
            username: get_string_value(&config, &["username"]).unwrap_or_default(),
            password_hash: get_string_value(&config, &["password_hash"]).unwrap_or_default(),
            token_secret,
            log_level: get_string_value(&config, &["log_level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["log_format"])
                .unwrap_or_else(|| "pretty".to_string()),
            debug_http_status: std::env::var(STATUS_OVERRIDE_ENV)
                .ok()
                .filter(|value| !value.trim().is_empty()),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            anyhow::bail!("username must not be empty");
        }
        if self.password_hash.trim().is_empty() {
            anyhow::bail!("password_hash must not be empty; generate one with `mss-node hash-password`");
        }
        if self.token_secret.is_empty() {
            anyhow::bail!("token_secret must not be empty; generate one with `mss-node generate-secret`");
        }
        if self.port == 0 {
            anyhow::bail!("port must be greater than zero");
        }
        if self.ips.is_empty() {
            anyhow::bail!("at least one valid listen address is required in ips");
        }
        if self.use_https && !self.cert_dir.is_dir() {
            anyhow::bail!(
                "cert_dir {} is not a directory",
                self.cert_dir.display()
            );
        }
        self.check_storage_location()
    }

    /// The storage root must already exist and accept new files; containers
    /// are created below it on demand.
    fn check_storage_location(&self) -> Result<()> {
        let root = &self.storage_location;
        let meta = fs::metadata(root).with_context(|| {
            format!("storage_location {} is not accessible", root.display())
        })?;
        if !meta.is_dir() {
            anyhow::bail!("storage_location {} is not a directory", root.display());
        }

        let marker = root.join(STORAGE_CHECK_FILE);
        fs::write(&marker, MSS_VERSION)
            .with_context(|| format!("storage_location {} is not writable", root.display()))?;
        if let Err(err) = fs::remove_file(&marker) {
            warn!("Failed to remove {}: {}", marker.display(), err);
        }
        Ok(())
    }

    fn scheme(&self) -> Scheme {
        if self.use_https {
            Scheme::Https
        } else {
            Scheme::Http
        }
    }

    fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            addresses: self.ips.clone(),
            port: self.port,
            cert_dir: self.use_https.then(|| self.cert_dir.clone()),
        }
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn parse_ips(values: &[String]) -> Vec<IpAddr> {
    values
        .iter()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .filter_map(|value| match value.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(err) => {
                warn!("Invalid listen address {}: {}", value, err);
                None
            }
        })
        .collect()
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<NodeConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = NodeConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut NodeConfig) {
    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
}

fn cli() -> Command {
    Command::new("mss-node")
        .version(MSS_VERSION)
        .about("Media storage service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (defaults to ./mss.toml when present)")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override the listen port")
                .global(true),
        )
        .subcommand(Command::new("serve").about("Serve the storage API (default)"))
        .subcommand(
            Command::new("hash-password")
                .about("Hash a password for the password_hash setting")
                .arg(
                    Arg::new("stdin")
                        .long("stdin")
                        .action(ArgAction::SetTrue)
                        .help("Read the password from stdin instead of prompting"),
                ),
        )
        .subcommand(
            Command::new("generate-secret").about("Print a random base64 token_secret"),
        )
        .subcommand(Command::new("version").about("Print version information"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("hash-password", sub_matches)) => return print_password_hash(sub_matches),
        Some(("generate-secret", _)) => {
            println!("{}", BASE64.encode(generate_token_secret()));
            return Ok(());
        }
        Some(("version", _)) => {
            print_version_info();
            return Ok(());
        }
        _ => {}
    }

    let serve_matches = matches.subcommand_matches("serve").unwrap_or(&matches);
    let config = load_config_with_overrides(serve_matches)?;

    init_logging(&config)?;

    info!(
        "Starting media storage service {} (commit {})",
        MSS_VERSION,
        git_commit_hash()
    );
    if let Some(path) = &config.config_path {
        info!("Loaded configuration from {}", path.display());
    }

    run(config).await
}

async fn run(config: NodeConfig) -> Result<()> {
    let account = Account {
        username: config.username.clone(),
        password_hash: config.password_hash.clone(),
    };
    let state = Arc::new(AppState {
        authenticator: Authenticator::new(account, &config.token_secret),
        layout: StorageLayout::new(config.storage_location.clone()),
        scheme: config.scheme(),
    });

    info!(
        "Serving account {} from {}",
        state.authenticator.username(),
        state.layout.root().display()
    );

    let status_override = config
        .debug_http_status
        .as_deref()
        .and_then(StatusOverride::parse);
    if let (Some(raw), None) = (&config.debug_http_status, &status_override) {
        warn!("Ignoring {}={:?}: no usable entries", STATUS_OVERRIDE_ENV, raw);
    }

    let app = build_router(state, status_override);
    let handles = spawn_listeners(app, &config.listener_config());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}

fn init_logging(config: &NodeConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn print_version_info() {
    println!("mss-node {} (commit {})", MSS_VERSION, git_commit_hash());
}

fn print_password_hash(matches: &clap::ArgMatches) -> Result<()> {
    let password = if matches.get_flag("stdin") {
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .context("failed to read password from stdin")?;
        line.trim_end_matches(['\r', '\n']).to_string()
    } else {
        rpassword::prompt_password("Password: ").context("failed to read password")?
    };

    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }

    println!("{}", hash_password(&password)?);
    Ok(())
}
