use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use omegaup_gitserver::interactive::LibinteractiveCompiler;
use omegaup_gitserver::problem::OVERALL_WALL_TIME_HARD_LIMIT;
use omegaup_gitserver::protocol::GitProtocol;
use omegaup_gitserver::request::{
    AuthorizationLevel, AuthorizationResponse, GitOperation, RequestContext,
};
use omegaup_gitserver::server::auth::basic_auth;
use omegaup_gitserver::server::{create_router, AppState};

#[derive(Parser)]
#[command(name = "omegaup-gitserver")]
#[command(about = "Git server for omegaUp problem repositories", long_about = None)]
struct Cli {
    /// Root path of all repositories
    #[arg(long)]
    root: PathBuf,

    /// Port in which the server will listen
    #[arg(long, default_value_t = 33861)]
    port: u16,

    /// Port in which the pprof server would listen; 0 disables it
    #[arg(long = "pprof-port", default_value_t = 0)]
    pprof_port: u16,

    /// Path of libinteractive.jar
    #[arg(
        long = "libinteractive-path",
        default_value = "/usr/share/java/libinteractive.jar"
    )]
    libinteractive_path: PathBuf,
}

fn authorize(
    ctx: &mut RequestContext,
    headers: &axum::http::HeaderMap,
    repository: &str,
    operation: GitOperation,
) -> AuthorizationResponse {
    let Some((username, _password)) = basic_auth(headers) else {
        return AuthorizationResponse::denied(true);
    };

    info!(
        username = %username,
        repository = %repository,
        operation = %operation.as_str(),
        "auth"
    );
    ctx.can_view = true;
    ctx.username = Some(username.clone());
    if username == "admin" {
        ctx.is_admin = true;
        ctx.can_edit = true;
        return AuthorizationResponse::granted(AuthorizationLevel::Allowed);
    }
    ctx.can_edit = true;
    AuthorizationResponse::granted(AuthorizationLevel::Restricted)
}

fn reference_discovery(ctx: &RequestContext, reference_name: &str) -> bool {
    if ctx.can_edit {
        return true;
    }
    if ctx.has_solved {
        return reference_name == "refs/heads/public"
            || reference_name == "refs/heads/protected"
            || reference_name == "refs/heads/private";
    }
    reference_name == "refs/heads/public"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    if !cli.root.is_dir() {
        anyhow::bail!("root path {} is not a directory", cli.root.display());
    }
    if cli.pprof_port > 0 {
        warn!("pprof is not supported; ignoring -pprof-port");
    }

    let protocol = GitProtocol::new(
        Arc::new(authorize),
        Some(Arc::new(reference_discovery)),
        false,
        OVERALL_WALL_TIME_HARD_LIMIT,
        Arc::new(LibinteractiveCompiler {
            jar_path: cli.libinteractive_path,
        }),
    );

    let state = Arc::new(AppState {
        root: cli.root,
        protocol,
    });
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    info!(
        "git server ready for connections at http://localhost:{}",
        cli.port
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down server...");
        })
        .await
        .context("server error")?;

    info!("Server gracefully stopped.");
    Ok(())
}
