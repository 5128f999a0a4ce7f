//! outlook-mcp-rs: Outlook mail and calendar MCP server over Microsoft Graph
//!
//! Serves Outlook tools to MCP clients over stdio (default) or streamable
//! HTTP, authenticating with OAuth2 tokens that are cached on disk and
//! renewed silently.
//!
//! # Architecture
//!
//! - [`main`]: CLI entry point (`serve`, `auth`)
//! - [`config`]: Environment-driven configuration
//! - [`errors`]: Application error model with MCP error mapping
//! - [`store`]: Durable token cache file
//! - [`token_cache`]: In-memory credential cache with dirty tracking
//! - [`provider`]: Identity provider seam and Microsoft identity platform client
//! - [`auth`]: Token lifecycle (silent, app-only, interactive consent)
//! - [`graph`]: Authenticated Graph request pipeline with error classification
//! - [`attachments`]: Collision-free attachment persistence
//! - [`callback`]: Loopback listener for the consent redirect
//! - [`server`]: MCP tool handlers
//! - [`models`]: Tool input DTOs and response envelope

mod attachments;
mod auth;
mod callback;
mod config;
mod errors;
mod graph;
mod models;
mod provider;
mod server;
mod store;
mod token_cache;

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use tracing_subscriber::EnvFilter;

use attachments::AttachmentStore;
use auth::{AuthManager, graph_scopes};
use config::ServerConfig;
use errors::{AppError, AppResult};
use graph::GraphClient;
use provider::EntraProvider;
use server::OutlookServer;
use store::TokenStore;

/// How long `auth` waits for the browser redirect
const CONSENT_WAIT: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "outlook-mcp-rs", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve MCP tools (stdio unless --http)
    Serve {
        /// Use the streamable HTTP transport instead of stdio
        #[arg(long)]
        http: bool,
        /// HTTP listen port
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Sign in interactively and cache the tokens
    Auth,
}

/// Application entry point
///
/// Loads `.env`, initializes tracing to stderr (stdout carries the stdio
/// transport), and dispatches the subcommand.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load_from_env()?;
    match cli.command.unwrap_or(Command::Serve {
        http: false,
        port: 8000,
    }) {
        Command::Serve { http, port } => serve(config, http, port).await,
        Command::Auth => run_auth(&config).await.map_err(Into::into),
    }
}

async fn build_auth(config: &ServerConfig) -> AppResult<Arc<AuthManager>> {
    let provider = Arc::new(EntraProvider::from_config(config)?);
    let store = TokenStore::new(config.token_cache_path.clone());
    Ok(Arc::new(AuthManager::load(provider, store).await?))
}

async fn serve(config: ServerConfig, http: bool, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let auth = build_auth(&config).await?;
    let graph = Arc::new(GraphClient::new(
        auth,
        config.graph_base_url.clone(),
        graph_scopes(),
        Duration::from_secs(config.request_timeout_secs),
    ));
    let attachments = Arc::new(AttachmentStore::new(config.attachment_dir.clone()));
    let server = OutlookServer::new(graph.clone(), attachments);

    let result = if http {
        serve_http(server, port).await
    } else {
        tracing::info!("serving MCP over stdio");
        run_until_shutdown(serve_stdio(server), shutdown_signal()).await
    };

    graph.close().await;
    result
}

async fn serve_stdio(server: OutlookServer) -> Result<(), Box<dyn std::error::Error>> {
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}

/// Drive `transport` until it ends or `shutdown` resolves
async fn run_until_shutdown<T, S>(transport: T, shutdown: S) -> Result<(), Box<dyn std::error::Error>>
where
    T: Future<Output = Result<(), Box<dyn std::error::Error>>>,
    S: Future<Output = ()>,
{
    tokio::select! {
        result = transport => result,
        () = shutdown => Ok(()),
    }
}

async fn serve_http(server: OutlookServer, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );
    let router = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    tracing::info!(port, "serving MCP over streamable HTTP at /mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// Interactive consent: reuse a silent token if possible, else run the browser flow
async fn run_auth(config: &ServerConfig) -> AppResult<()> {
    if config.client_id.is_empty() {
        return Err(AppError::invalid(
            "OUTLOOK_CLIENT_ID must be set before signing in",
        ));
    }
    let auth = build_auth(config).await?;
    let scopes = graph_scopes();

    if let Some(token) = auth.try_silent(&scopes).await? {
        let who = auth
            .account_username()
            .await
            .unwrap_or_else(|| "cached account".to_owned());
        println!(
            "Already signed in as {who}; token valid until {} ({} scopes)",
            token.expires_at.to_rfc3339(),
            token.scopes.len()
        );
        return Ok(());
    }

    let request = auth.begin_interactive_authorization(&scopes, &config.redirect_uri());
    println!("Open this URL in a browser to sign in:\n\n{}\n", request.authorization_url);
    println!("Waiting for the redirect to {} ...", config.redirect_uri());

    let params = callback::wait_for_callback(config.redirect_port, CONSENT_WAIT).await?;
    let account = auth
        .complete_interactive_authorization(&request.flow, &params)
        .await?;
    println!(
        "Signed in as {}; granted {}; tokens cached at {}",
        account.username.as_deref().unwrap_or(&account.home_account_id),
        account.scopes.join(" "),
        config.token_cache_path.display()
    );
    Ok(())
}
