//! # rendergate CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve renders over HTTP
//! rendergate serve -c rendergate.toml -b 0.0.0.0:8080
//!
//! # Render one URL and print the body to stdout
//! rendergate render https://shop.example.com/products/1 -c rendergate.toml -H accept-language:de
//! ```
//!
//! Logging goes through `tracing`; set `RUST_LOG` to override the default
//! `info` level. `render` logs to stderr so stdout carries only the body.

use anyhow::{Context, Result};
use argh::FromArgs;
use rendergate_common::RequestRenderApi;
use rendergate_server::{HttpServer, Orchestrator, RenderConfig, RenderRouter};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;

/// Environment variable consulted when `serve` is given no bind address.
const BIND_ENV: &str = "RENDERGATE_BIND";
const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(FromArgs)]
/// rendergate - server-side rendering gateway
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Render(RenderArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start the HTTP rendering server
struct ServeArgs {
    /// path to a TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// address to bind the HTTP server to
    ///
    /// Falls back to RENDERGATE_BIND, then 0.0.0.0:8080.
    #[argh(option, short = 'b')]
    bind: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "render")]
/// render a single URL and print the body
struct RenderArgs {
    /// URL to render
    #[argh(positional)]
    url: String,

    /// path to a TOML configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// request header visible to the program, as name:value (repeatable)
    #[argh(option, short = 'H', long = "header")]
    headers: Vec<String>,
}

fn load_config(path: Option<&str>) -> Result<RenderConfig> {
    match path {
        Some(path) => RenderConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => Ok(RenderConfig::default()),
    }
}

fn resolve_bind(flag: Option<String>, env: Option<String>) -> Result<SocketAddr> {
    let bind = flag.or(env).unwrap_or_else(|| DEFAULT_BIND.to_string());
    bind.parse()
        .with_context(|| format!("Invalid bind address '{}'", bind))
}

/// Splits `name:value`, trimming whitespace around the value.
fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("Invalid header '{}': expected name:value", raw))?;
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("Invalid header '{}': empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let addr = resolve_bind(args.bind, std::env::var(BIND_ENV).ok())?;

    let orchestrator = Orchestrator::from_config(&config)?;
    tracing::info!(
        registration = orchestrator.registration_name(),
        scripts = config.scripts.len(),
        loader = ?config.loader.kind,
        cache = config.cache.enabled,
        "Render orchestrator ready"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let server = HttpServer::new(RenderRouter::new(orchestrator, config.route.clone()));
    server
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn render(args: RenderArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let orchestrator = Orchestrator::from_config(&config)?;

    let mut api = RequestRenderApi::new();
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        api.insert(&name, value);
    }

    let result = orchestrator
        .render(&args.url, Arc::new(api))
        .await
        .with_context(|| format!("Failed to render {}", args.url))?;

    eprintln!("status: {}", result.status);
    for (name, value) in &result.headers {
        eprintln!("{}: {}", name, value);
    }
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&result.body)?;
    stdout.flush()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Default to INFO, but allow RUST_LOG to override
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Render(args) => render(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("Accept-Language: de-DE").unwrap(),
            ("Accept-Language".to_string(), "de-DE".to_string())
        );
        assert_eq!(
            parse_header("x-url:https://a.test/").unwrap(),
            ("x-url".to_string(), "https://a.test/".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(" :value").is_err());
    }

    #[test]
    fn test_bind_precedence() {
        let flag = resolve_bind(Some("127.0.0.1:9000".into()), Some("127.0.0.1:9001".into()));
        assert_eq!(flag.unwrap().port(), 9000);

        let env = resolve_bind(None, Some("127.0.0.1:9001".into()));
        assert_eq!(env.unwrap().port(), 9001);

        assert_eq!(resolve_bind(None, None).unwrap().port(), 8080);
        assert!(resolve_bind(Some("nonsense".into()), None).is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::from_args(
            &["rendergate"],
            &["render", "https://shop.test/", "-H", "a:1", "-H", "b:2", "-c", "x.toml"],
        )
        .unwrap();
        match cli.command {
            Commands::Render(args) => {
                assert_eq!(args.url, "https://shop.test/");
                assert_eq!(args.headers, vec!["a:1", "b:2"]);
                assert_eq!(args.config.as_deref(), Some("x.toml"));
            }
            Commands::Serve(_) => panic!("expected render"),
        }
    }

    #[test]
    fn test_missing_config_file() {
        assert!(load_config(Some("/nonexistent/rendergate.toml")).is_err());
        assert_eq!(load_config(None).unwrap(), RenderConfig::default());
    }
}
