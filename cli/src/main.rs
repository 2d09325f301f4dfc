use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use profile_gate::config::{GateConfig, RouteConfig};
use profile_gate::error::{ApiError, CacheError, ConfigError, IdpError};
use profile_gate::net::api::HttpProfileBackend;
use profile_gate::net::types::IdTokenClaims;
use profile_gate::session::guard::decide;
use profile_gate::session::{
    AuthSnapshot, CycleOutcome, FileStore, GuardInputs, IdentityProvider, IdpSession, LocalStateCache, LoginOptions,
    LogoutOptions, RoutePaths, SessionContext, SessionOptions, TokenOptions,
};
use serde_json::{Value, json};
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Api(#[from] ApiError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("could not read {path}: {source}")]
    ReadClaims { path: PathBuf, source: std::io::Error },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("resolution cycle was superseded")]
    Superseded,
}

#[derive(Parser, Debug)]
#[command(name = "profile-gate", about = "Inspect session resolution, route decisions and the local cache")]
struct Cli {
    #[arg(long, env = "PROFILE_CACHE_PATH", default_value = "./.profile-gate/state.json")]
    cache_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the route guard decision for a path and session state.
    Route(RouteArgs),
    /// Run one resolution cycle against the configured backend.
    Resolve(ResolveArgs),
    Cache(CacheCommand),
}

#[derive(Args, Debug)]
struct RouteArgs {
    #[arg(long)]
    path: String,

    #[arg(long, default_value_t = false)]
    authenticated: bool,

    #[arg(long, default_value_t = false)]
    loading: bool,

    #[arg(long, default_value_t = false)]
    profile_completed: bool,
}

#[derive(Args, Debug)]
struct ResolveArgs {
    /// JSON file holding the ID token claims.
    #[arg(long)]
    claims: PathBuf,

    /// Access token to present to the backend.
    #[arg(long, env = "PROFILE_ACCESS_TOKEN")]
    token: String,
}

#[derive(Args, Debug)]
struct CacheCommand {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Subcommand, Debug)]
enum CacheSubcommand {
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Route(args) => run_route(&args),
        Command::Resolve(args) => run_resolve(&cli.cache_path, args).await,
        Command::Cache(cache) => run_cache(&cli.cache_path, cache),
    }
}

fn run_route(args: &RouteArgs) -> Result<(), CliError> {
    let routes = match GateConfig::from_env() {
        Ok(config) => config.routes,
        Err(e) => {
            tracing::debug!(error = %e, "using default route layout");
            RouteConfig::default()
        }
    };
    let inputs = GuardInputs {
        is_authenticated: args.authenticated,
        is_loading: args.loading,
        profile_completed: args.profile_completed,
        current_path: args.path.clone(),
    };
    match decide(&RoutePaths::new(routes), &inputs) {
        Some(target) => println!("redirect {target}"),
        None => println!("stay"),
    }
    Ok(())
}

async fn run_resolve(cache_path: &Path, args: ResolveArgs) -> Result<(), CliError> {
    let config = GateConfig::from_env()?;
    let raw = std::fs::read_to_string(&args.claims)
        .map_err(|source| CliError::ReadClaims { path: args.claims.clone(), source })?;
    let claims: IdTokenClaims = serde_json::from_str(&raw)?;

    let idp = Arc::new(StaticIdentityProvider::new(claims, args.token));
    let backend = Arc::new(HttpProfileBackend::new(&config)?);
    let store = Arc::new(FileStore::new(cache_path));
    let ctx = SessionContext::new(SessionOptions::from(&config), idp.clone(), backend, store);

    let snapshot = AuthSnapshot::from(&*idp.session().borrow());
    if ctx.sync(snapshot).await == CycleOutcome::Discarded {
        return Err(CliError::Superseded);
    }
    let state = ctx.state();
    print_json(&json!({ "user": state.user, "profile_completed": state.profile_completed }))
}

fn run_cache(cache_path: &Path, cache: CacheCommand) -> Result<(), CliError> {
    let store = Arc::new(FileStore::new(cache_path));
    let cache_state = LocalStateCache::new(store);
    match cache.command {
        CacheSubcommand::Show => {
            let state = cache_state.hydrate();
            print_json(&json!({ "user": state.user, "profile_completed": state.profile_completed }))
        }
        CacheSubcommand::Clear => {
            cache_state.clear()?;
            eprintln!("cleared {}", cache_path.display());
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

/// Identity provider with a fixed, already-authenticated session.
struct StaticIdentityProvider {
    tx: watch::Sender<IdpSession>,
    token: String,
}

impl StaticIdentityProvider {
    fn new(claims: IdTokenClaims, token: String) -> Self {
        let (tx, _) = watch::channel(IdpSession::authenticated(claims));
        Self { tx, token }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn session(&self) -> watch::Receiver<IdpSession> {
        self.tx.subscribe()
    }

    async fn login_with_redirect(&self, _options: LoginOptions) -> Result<(), IdpError> {
        Err(IdpError::Login("interactive login is not available from the CLI".to_owned()))
    }

    async fn logout(&self, _options: LogoutOptions) -> Result<(), IdpError> {
        self.tx.send_replace(IdpSession::anonymous());
        Ok(())
    }

    async fn get_access_token_silently(&self, _options: TokenOptions) -> Result<String, IdpError> {
        Ok(self.token.clone())
    }
}
