//! tipvault: operator CLI for the submission confidentiality engine
//!
//! Commands:
//!   config show                         - display current configuration
//!   user create <name>                  - create a keyed user, print the recovery key once
//!   user provision <name>               - create an unkeyed user with a temporary password
//!   user passwd <name>                  - change a password (first set mints keys)
//!   user login <name>                   - verify a password
//!   user recover <name>                 - reset a lost password with the recovery key
//!   user recovery-key <name>            - show the recovery key again
//!   tip submit --to <name>... <preview> - create a submission
//!   tip read --as <name> <tip>          - decrypt a submission as a receiver
//!   tip grant --as <name> <tip> <name>  - give another receiver access
//!   tip revoke <tip> <name>             - remove a receiver's access
//!   tip reconcile [<tip>]               - check fan-out completeness
//!
//! Sessions live only as long as one command; commands that need a private
//! key log in first and log out before exiting.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use tracing::info;

use tipvault_core::config::TipvaultConfig;
use tipvault_core::{SessionId, TipId, UserId};
use tipvault_keys::{JsonFileStore, KeyService, UserRole};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tipvault",
    version,
    about = "Tipvault key management",
    long_about = "tipvault: manage user keys, submission keys and receiver access"
)]
struct Cli {
    /// Path to tipvault.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "TIPVAULT_CONFIG",
        default_value = "/etc/tipvault/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long, env = "TIPVAULT_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides the config
    #[arg(long, env = "TIPVAULT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Record store path (overrides config)
    #[arg(long, env = "TIPVAULT_STORE")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Clone, Debug, ValueEnum)]
enum RoleArg {
    Admin,
    Receiver,
    Custodian,
}

impl From<RoleArg> for UserRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => UserRole::Admin,
            RoleArg::Receiver => UserRole::Receiver,
            RoleArg::Custodian => UserRole::Custodian,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// User accounts and their keys
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Submissions and receiver access
    Tip {
        #[command(subcommand)]
        action: TipAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Create a user with a real password
    Create {
        username: String,
        #[arg(long, value_enum, default_value = "receiver")]
        role: RoleArg,
        /// Read the password from this environment variable instead of prompting
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Create an unkeyed user; keys are minted at the first password change
    Provision {
        username: String,
        #[arg(long, value_enum, default_value = "receiver")]
        role: RoleArg,
        /// Let the user set a password once without the old one
        #[arg(long)]
        change_needed: bool,
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Change a password
    Passwd {
        username: String,
        /// Use the one-time change flag instead of the old password
        #[arg(long)]
        skip_old: bool,
        #[arg(long)]
        old_password_env: Option<String>,
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Verify a password
    Login {
        username: String,
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Reset a lost password with the recovery key
    Recover {
        username: String,
        /// Read the recovery words from this environment variable
        #[arg(long)]
        recovery_env: Option<String>,
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Show the recovery key again (requires the password)
    RecoveryKey {
        username: String,
        #[arg(long)]
        password_env: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum TipAction {
    /// Create a submission addressed to receivers
    Submit {
        /// Receiver usernames
        #[arg(long = "to", required = true)]
        receivers: Vec<String>,
        /// Preview text
        preview: String,
    },

    /// Decrypt a submission as one of its receivers
    Read {
        tip: String,
        #[arg(long = "as")]
        receiver: String,
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Grant another receiver access through the grantor's own key
    Grant {
        tip: String,
        receiver: String,
        #[arg(long = "as")]
        grantor: String,
        #[arg(long)]
        password_env: Option<String>,
    },

    /// Remove a receiver's access
    Revoke { tip: String, receiver: String },

    /// Check that every expected receiver holds a key (all tips when omitted)
    Reconcile { tip: Option<String> },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.daemon.log_format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "tipvault starting"
    );

    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
        Commands::User { action } => {
            let svc = open_service(&config, cli.store.as_deref())?;
            cmd_user(&svc, action).await
        }
        Commands::Tip { action } => {
            let svc = open_service(&config, cli.store.as_deref())?;
            cmd_tip(&svc, action).await
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // logs go to stderr so command output stays pipeable
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn load_config(path: &Path) -> Result<TipvaultConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        eprintln!(
            "warning: config file not found: {}  (using defaults)",
            path.display()
        );
        Ok(TipvaultConfig::default())
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(format!("{home}/{rest}"))
    } else {
        path.to_path_buf()
    }
}

fn open_service(config: &TipvaultConfig, override_path: Option<&Path>) -> Result<KeyService<JsonFileStore>> {
    let path = override_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| expand_tilde(&config.storage.path));
    let store = JsonFileStore::open(&path)
        .with_context(|| format!("opening record store: {}", path.display()))?;
    Ok(KeyService::from_config(store, config))
}

/// Read a secret from `env_var` when given, otherwise prompt without echo.
fn read_secret(prompt: &str, env_var: Option<&str>) -> Result<SecretString> {
    let value = match env_var {
        Some(var) => std::env::var(var).with_context(|| format!("{var} is not set"))?,
        None => rpassword::prompt_password(prompt).context("reading from terminal")?,
    };
    if value.is_empty() {
        anyhow::bail!("empty input");
    }
    Ok(SecretString::from(value))
}

/// Read a new password twice when prompting.
fn read_new_password(env_var: Option<&str>) -> Result<SecretString> {
    let first = read_secret("New password: ", env_var)?;
    if env_var.is_none() {
        let second = read_secret("Repeat new password: ", None)?;
        if first.expose_secret() != second.expose_secret() {
            anyhow::bail!("passwords do not match");
        }
    }
    Ok(first)
}

fn user_id_of(svc: &KeyService<JsonFileStore>, username: &str) -> Result<UserId> {
    use tipvault_keys::KeyStore;

    svc.store()
        .find_user_by_username(username)?
        .map(|u| u.id)
        .with_context(|| format!("no such user: {username}"))
}

fn print_recovery_key(recovery_key: &SecretString) {
    println!("Recovery key (shown once, store it offline):");
    println!();
    println!("  {}", recovery_key.expose_secret());
    println!();
}

/// Log in and return the session of a keyed user.
async fn login_session(
    svc: &KeyService<JsonFileStore>,
    username: &str,
    password_env: Option<&str>,
) -> Result<(UserId, Option<SessionId>)> {
    let password = read_secret(&format!("Password for {username}: "), password_env)?;
    let login = svc.login(username, password, None).await?;
    Ok((login.user_id, login.session_id))
}

// ── `tipvault config show` ────────────────────────────────────────────────────

fn cmd_config_show(config: &TipvaultConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `tipvault user …` ─────────────────────────────────────────────────────────

async fn cmd_user(svc: &KeyService<JsonFileStore>, action: UserAction) -> Result<()> {
    match action {
        UserAction::Create {
            username,
            role,
            password_env,
        } => {
            let password = read_new_password(password_env.as_deref())?;
            let created = svc.create_user(&username, role.into(), password).await?;
            println!("created user {username} ({})", created.user_id);
            match &created.recovery_key {
                Some(key) => print_recovery_key(key),
                None => println!("encryption is disabled for this tenant: no keys issued"),
            }
        }

        UserAction::Provision {
            username,
            role,
            change_needed,
            password_env,
        } => {
            let password = read_new_password(password_env.as_deref())?;
            let id = svc
                .provision_user(&username, role.into(), password, change_needed)
                .await?;
            println!("provisioned user {username} ({id}) without keys");
        }

        UserAction::Passwd {
            username,
            skip_old,
            old_password_env,
            password_env,
        } => {
            let id = user_id_of(svc, &username)?;
            let old = if skip_old {
                None
            } else {
                Some(read_secret("Current password: ", old_password_env.as_deref())?)
            };
            let new = read_new_password(password_env.as_deref())?;
            let changed = svc.change_password(&id, None, old, new).await?;
            println!("password changed for {username}");
            if let Some(key) = &changed.recovery_key {
                print_recovery_key(key);
            }
            if let Some(sid) = &changed.session_id {
                svc.logout(sid);
            }
        }

        UserAction::Login {
            username,
            password_env,
        } => {
            let password = read_secret(&format!("Password for {username}: "), password_env.as_deref())?;
            let login = svc.login(&username, password, None).await?;
            println!(
                "authenticated {username} ({}): {}",
                login.user_id,
                if login.session_id.is_some() {
                    "private key unlocked"
                } else {
                    "no keys yet"
                }
            );
            if login.password_change_needed {
                println!("a password change is required");
            }
            if let Some(sid) = &login.session_id {
                svc.logout(sid);
            }
        }

        UserAction::Recover {
            username,
            recovery_env,
            password_env,
        } => {
            let words = read_secret("Recovery key: ", recovery_env.as_deref())?;
            let new = read_new_password(password_env.as_deref())?;
            let sid = svc.recover(&username, words, new).await?;
            svc.logout(&sid);
            println!("password reset for {username}");
        }

        UserAction::RecoveryKey {
            username,
            password_env,
        } => {
            let (_, sid) = login_session(svc, &username, password_env.as_deref()).await?;
            let sid = sid.with_context(|| format!("{username} has no keys"))?;
            let key = svc.recovery_key(&sid).await;
            svc.logout(&sid);
            match key? {
                Some(key) => print_recovery_key(&key),
                None => println!("{username} has no recovery key"),
            }
        }
    }
    Ok(())
}

// ── `tipvault tip …` ──────────────────────────────────────────────────────────

async fn cmd_tip(svc: &KeyService<JsonFileStore>, action: TipAction) -> Result<()> {
    match action {
        TipAction::Submit { receivers, preview } => {
            let ids = receivers
                .iter()
                .map(|name| user_id_of(svc, name))
                .collect::<Result<Vec<_>>>()?;
            let tip = svc.submit(ids, preview).await?;
            println!("{tip}");
        }

        TipAction::Read {
            tip,
            receiver,
            password_env,
        } => {
            let tip = TipId::from(tip);
            let (id, sid) = login_session(svc, &receiver, password_env.as_deref()).await?;
            let preview = svc.read_preview(&id, sid.as_ref(), &tip).await;
            let files = svc.read_files(&id, sid.as_ref(), &tip).await;
            if let Some(sid) = &sid {
                svc.logout(sid);
            }

            println!("{}", preview?);
            for file in files? {
                println!("  {} ({}, {} bytes)", file.name, file.content_type, file.size);
            }
        }

        TipAction::Grant {
            tip,
            receiver,
            grantor,
            password_env,
        } => {
            let tip = TipId::from(tip);
            let receiver_id = user_id_of(svc, &receiver)?;
            let (_, sid) = login_session(svc, &grantor, password_env.as_deref()).await?;
            let result = svc.grant(sid.as_ref(), &tip, &receiver_id).await;
            if let Some(sid) = &sid {
                svc.logout(sid);
            }
            result?;
            println!("granted {receiver} access to {tip}");
        }

        TipAction::Revoke { tip, receiver } => {
            let tip = TipId::from(tip);
            let receiver_id = user_id_of(svc, &receiver)?;
            if svc.revoke(&tip, &receiver_id).await? {
                println!("revoked {receiver} from {tip}");
            } else {
                println!("{receiver} had no access to {tip}");
            }
        }

        TipAction::Reconcile { tip: Some(tip) } => {
            let report = svc.reconcile(&TipId::from(tip))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_accessible() {
                std::process::exit(1);
            }
        }

        TipAction::Reconcile { tip: None } => {
            let dirty = svc.reconcile_all()?;
            for (id, report) in &dirty {
                println!("{id}: {}", serde_json::to_string(report)?);
            }
            if !dirty.is_empty() {
                std::process::exit(1);
            }
            println!("all submissions fully fanned out");
        }
    }
    Ok(())
}
