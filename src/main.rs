//! Platform Gateway - protocol gateway for external platform APIs

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};

use platform_gateway::{
    Gateways, ProtocolGateway,
    cli::{Cli, Command},
    config::Config,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let gateways = match load_gateways(cli.config.as_deref()) {
        Ok(g) => g,
        Err(code) => return code,
    };

    let code = match cli.command {
        Command::Tools { platform } => run_tools(&gateways, platform.as_deref()),
        Command::Invoke { platform, tool, args } => run_invoke(&gateways, &platform, &tool, &args).await,
        Command::AuthUrl { platform } => run_auth_url(&gateways, &platform),
        Command::ExchangeCode { platform, tool, args } => {
            run_exchange(&gateways, &platform, tool.as_deref(), &args).await
        }
        Command::VerifyWebhook {
            platform,
            event,
            signature,
            payload,
        } => run_verify(&gateways, &platform, &event, &signature, &payload).await,
        Command::ServeWebhooks { bind } => run_serve_webhooks(&gateways, bind).await,
        Command::Stats { platform } => run_stats(&gateways, platform.as_deref()),
    };

    gateways.close_all().await;
    code
}

fn load_gateways(path: Option<&Path>) -> Result<Gateways, ExitCode> {
    let config = Config::load(path).map_err(|e| {
        error!("Failed to load configuration: {e}");
        ExitCode::FAILURE
    })?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        platforms = config.platforms.len(),
        "Starting Platform Gateway"
    );
    Gateways::from_config(&config).map_err(|e| {
        error!("Failed to create gateways: {e}");
        ExitCode::FAILURE
    })
}

fn gateway(gateways: &Gateways, platform: &str) -> Result<Arc<ProtocolGateway>, ExitCode> {
    gateways.require(platform).map_err(|e| {
        eprintln!("❌ {e}");
        ExitCode::FAILURE
    })
}

fn parse_args(args: &str) -> Result<Value, ExitCode> {
    serde_json::from_str(args).map_err(|e| {
        eprintln!("❌ Invalid JSON arguments: {e}");
        ExitCode::FAILURE
    })
}

fn print_json<T: serde::Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn run_tools(gateways: &Gateways, only: Option<&str>) -> ExitCode {
    for (name, gw) in gateways.iter().filter(|(n, _)| only.is_none_or(|o| o == n.as_str())) {
        println!("📦 {name} ({}, {} tools)", gw.auth().auth_type(), gw.tools().len());
        for tool in gw.tools().list() {
            println!("   {} [{}] {} {}", tool.name, tool.category, tool.method, tool.endpoint);
            if !tool.description.is_empty() {
                println!("      {}", tool.description);
            }
        }
        println!();
    }
    ExitCode::SUCCESS
}

async fn run_invoke(gateways: &Gateways, platform: &str, tool: &str, args: &str) -> ExitCode {
    let gw = match gateway(gateways, platform) {
        Ok(g) => g,
        Err(code) => return code,
    };
    let args = match parse_args(args) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let result = gw.execute_tool(tool, args).await;
    print_json(&result);
    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run_auth_url(gateways: &Gateways, platform: &str) -> ExitCode {
    let gw = match gateway(gateways, platform) {
        Ok(g) => g,
        Err(code) => return code,
    };
    match gw.build_authorization_url() {
        Ok(url) => {
            println!("{url}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_exchange(gateways: &Gateways, platform: &str, tool: Option<&str>, args: &str) -> ExitCode {
    let gw = match gateway(gateways, platform) {
        Ok(g) => g,
        Err(code) => return code,
    };
    let url = match gw.build_authorization_url() {
        Ok(u) => u,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("Open this URL and authorize:\n\n  {url}\n");
    println!("Paste the redirect URL (or the code):");

    let mut line = String::new();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    if let Err(e) = stdin.read_line(&mut line).await {
        eprintln!("❌ Failed to read stdin: {e}");
        return ExitCode::FAILURE;
    }
    let (code, state) = parse_redirect(line.trim());
    if code.is_empty() {
        eprintln!("❌ no authorization code supplied");
        return ExitCode::FAILURE;
    }

    match gw.exchange_code(&code, state.as_deref()).await {
        Ok(true) => println!("✅ {platform}: authorized"),
        Ok(false) => {
            eprintln!("❌ {platform}: token endpoint returned no usable token");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    }

    let Some(tool) = tool else {
        return ExitCode::SUCCESS;
    };
    let args = match parse_args(args) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let result = gw.execute_tool(tool, args).await;
    print_json(&result);
    if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Split a pasted redirect URL into `(code, state)`; anything else is the bare code
fn parse_redirect(input: &str) -> (String, Option<String>) {
    let Ok(url) = url::Url::parse(input) else {
        return (input.to_string(), None);
    };
    let mut code = String::new();
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = value.into_owned(),
            "state" => state = Some(value.into_owned()),
            _ => {}
        }
    }
    (code, state)
}

async fn run_verify(
    gateways: &Gateways,
    platform: &str,
    event: &str,
    signature: &str,
    payload: &Path,
) -> ExitCode {
    let gw = match gateway(gateways, platform) {
        Ok(g) => g,
        Err(code) => return code,
    };
    let body = match tokio::fs::read(payload).await {
        Ok(b) => b,
        Err(e) => {
            eprintln!("❌ Failed to read {}: {e}", payload.display());
            return ExitCode::FAILURE;
        }
    };

    if gw.verify_webhook(&body, signature, event) {
        println!("✅ signature valid");
        ExitCode::SUCCESS
    } else {
        eprintln!("❌ signature invalid");
        ExitCode::FAILURE
    }
}

#[cfg(feature = "webhook-receiver")]
async fn run_serve_webhooks(gateways: &Gateways, bind: std::net::SocketAddr) -> ExitCode {
    use platform_gateway::webhook::receiver;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    let (tx, mut rx) = mpsc::channel(256);
    let mut app = axum::Router::new();
    for (name, gw) in gateways.iter() {
        let routes = receiver::router(name, gw.webhook_verifier(), gw.signature_header(), tx.clone());
        app = app.nest(&format!("/{name}"), routes);
    }
    drop(tx);

    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {bind}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
    });

    // Verified events are emitted as JSON lines
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        }
    });

    let result = receiver::serve(listener, app, shutdown).await;
    printer.abort();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Webhook receiver error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(not(feature = "webhook-receiver"))]
async fn run_serve_webhooks(_gateways: &Gateways, _bind: std::net::SocketAddr) -> ExitCode {
    eprintln!("❌ built without the webhook-receiver feature");
    ExitCode::FAILURE
}

fn run_stats(gateways: &Gateways, only: Option<&str>) -> ExitCode {
    let stats: Vec<_> = gateways
        .iter()
        .filter(|(n, _)| only.is_none_or(|o| o == n.as_str()))
        .map(|(_, gw)| gw.get_stats())
        .collect();
    print_json(&stats);
    ExitCode::SUCCESS
}
