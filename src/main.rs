use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use chatgate_core::config::{self, Config};
use chatgate_core::identity::GotrueVerifier;
use chatgate_core::provider::{GeminiProvider, GenerativeModel};
use chatgate_core::service::http::{serve, AppState};
use chatgate_core::store::postgrest::PostgrestStore;

#[derive(Parser)]
#[command(
    name = "chatgate",
    about = "chatgate - chat backend with guest quotas",
    version = chatgate_core::VERSION,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Bind host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Talk to a running chatgate API
    Chat {
        /// Message to send (or omit for interactive mode)
        message: Vec<String>,
        /// API endpoint
        #[arg(long, default_value = "http://localhost:8000/api/chat")]
        api: String,
        /// Session ID (defaults to a persisted per-device session)
        #[arg(long)]
        session: Option<String>,
    },
    /// Show resolved configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chatgate=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(host, port).await?,
        Commands::Chat {
            message,
            api,
            session,
        } => cmd_chat(message, api, session).await?,
        Commands::Status => cmd_status(),
    }

    Ok(())
}

// ====== Commands ======

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut cfg = config::load_config_from_env();
    if let Some(host) = host {
        cfg.gateway.host = host;
    }
    if let Some(port) = port {
        cfg.gateway.port = port;
    }

    let store = Arc::new(PostgrestStore::new(&cfg.store)?);
    let verifier = Arc::new(GotrueVerifier::new(&cfg));
    let model: Arc<dyn GenerativeModel> = Arc::new(GeminiProvider::new(&cfg.model)?);

    let addr = cfg.bind_addr();
    let state = Arc::new(AppState::new(
        cfg,
        store.clone(),
        store,
        verifier,
        model,
    ));

    serve(&addr, state).await
}

/// Get or create the persisted device fingerprint.
fn get_fingerprint() -> Result<String> {
    persisted_id("fingerprint", "dev")
}

/// Get or create the persisted chat session ID.
fn get_session_id() -> Result<String> {
    persisted_id("cli_session_id", "cli")
}

fn persisted_id(file: &str, prefix: &str) -> Result<String> {
    let data_dir = config::get_data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let path = data_dir.join(file);
    if path.exists() {
        Ok(std::fs::read_to_string(&path)?.trim().to_string())
    } else {
        let id = format!("{}:{}", prefix, uuid::Uuid::new_v4());
        std::fs::write(&path, &id)?;
        Ok(id)
    }
}

/// Talk to a deployed chatgate API — no config needed.
async fn cmd_chat(message: Vec<String>, api_url: String, session: Option<String>) -> Result<()> {
    let session_id = match session {
        Some(sid) => sid,
        None => get_session_id()?,
    };
    let fingerprint = get_fingerprint()?;
    let client = reqwest::Client::new();

    if message.is_empty() {
        // Interactive mode
        println!("chatgate CLI (Ctrl+C to exit)");
        println!("  Session: {}", session_id);
        println!();

        loop {
            use std::io::Write;
            print!("You: ");
            std::io::stdout().flush()?;

            let mut input = String::new();
            if std::io::stdin().read_line(&mut input)? == 0 {
                break;
            }
            let input = input.trim();
            if input.is_empty() {
                continue;
            }

            match chat_api(&client, &api_url, input, &session_id, &fingerprint).await {
                Ok(resp) => println!("\n{}\n", resp),
                Err(e) => eprintln!("Error: {}", e),
            }
        }
    } else {
        let msg = message.join(" ");
        match chat_api(&client, &api_url, &msg, &session_id, &fingerprint).await {
            Ok(resp) => println!("{}", resp),
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    Ok(())
}

async fn chat_api(
    client: &reqwest::Client,
    api_url: &str,
    message: &str,
    session_id: &str,
    fingerprint: &str,
) -> Result<String> {
    let response = client
        .post(api_url)
        .json(&serde_json::json!({
            "message": message,
            "session_id": session_id,
            "fingerprint": fingerprint,
        }))
        .send()
        .await?;

    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if status.as_u16() == 403 {
        let reason = body
            .get("detail")
            .and_then(|v| v.as_str())
            .unwrap_or("limit reached");
        anyhow::bail!("request denied: {}", reason);
    }
    if !status.is_success() {
        anyhow::bail!("API error ({}): {}", status, body);
    }

    let reply = body
        .get("reply")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if let Some(count) = body.get("prompt_count").and_then(|v| v.as_u64()) {
        tracing::debug!("prompt count now {}", count);
    }
    Ok(reply)
}

fn cmd_status() {
    let cfg: Config = config::load_config_from_env();

    println!("chatgate status\n");
    println!(
        "Store:  {}",
        if cfg.store.url.is_empty() {
            "(not configured)"
        } else {
            cfg.store.url.as_str()
        }
    );
    println!(
        "Auth:   {}",
        if cfg.auth_url().is_empty() {
            "(not configured)"
        } else {
            cfg.auth_url()
        }
    );
    println!("Model:  {}", cfg.model.model);
    println!(
        "Key:    {}",
        if cfg.model.api_key.is_empty() {
            "missing"
        } else {
            "configured"
        }
    );
    println!(
        "Limits: {} guest / {} user",
        cfg.limits.guest_limit,
        cfg.limits.user_limit()
    );
    println!("Bind:   {}", cfg.bind_addr());
}
