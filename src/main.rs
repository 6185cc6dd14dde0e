//! Servlet Engine - Main Entry Point
//!
//! Demo front end: reads one JSON request per line from stdin, serves it
//! through the engine and prints the JSON response on stdout.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use servlet_engine::{
    Application, ApplicationBuilder, AuthScheme, Config, Credentials, Engine, Request, Response,
    SecuredUrl, Servlet,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Logs go to stderr, stdout carries responses
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("servlet_engine=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    print_banner();

    let engine = Arc::new(demo_engine(Config::from_env())?);

    // single writer so concurrent responses never interleave
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if let Err(e) = stdout.write_all(format!("{line}\n").as_bytes()).await {
                warn!("Failed to write response: {:?}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read error: {:?}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let engine = Arc::clone(&engine);
                let out_tx = out_tx.clone();
                let request_id = Uuid::new_v4();
                in_flight.spawn(
                    async move {
                        let output = serve_line(engine, line, request_id).await;
                        let _ = out_tx.send(output);
                    }
                    .instrument(info_span!("request", id = %request_id)),
                );
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    drop(out_tx);
    let _ = writer.await;

    tokio::task::spawn_blocking(move || engine.shutdown()).await?;
    Ok(())
}

/// Parse one request line and run it on a blocking thread
async fn serve_line(engine: Arc<Engine>, line: String, request_id: Uuid) -> String {
    let request = match Request::from_json(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Bad request line: {}", e);
            let response = Response::new()
                .with_status(400)
                .with_body(&format!("Invalid request: {e}"));
            return json!({ "request_id": request_id.to_string(), "response": response }).to_string();
        }
    };

    let response = match tokio::task::spawn_blocking(move || engine.process(request, Response::new())).await {
        Ok(response) => response,
        Err(e) => Response::new()
            .with_status(500)
            .with_body(&format!("Internal server error: {e}")),
    };
    info!(status = response.status, "request served");

    json!({ "request_id": request_id.to_string(), "response": response }).to_string()
}

fn demo_engine(config: Config) -> Result<Engine> {
    let password = std::env::var("DEMO_ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());
    let admin = SecuredUrl::new(
        AuthScheme::Basic,
        "hello-admin",
        Arc::new(move |c: &Credentials| match c {
            Credentials::Basic { username, password: given } => username == "admin" && *given == password,
            Credentials::Digest(_) => false,
        }),
    );

    let engine = Engine::builder(config)
        .application(
            ApplicationBuilder::new("hello")
                .virtual_host("localhost")
                .secured_servlet("/admin/*", greeting(), admin)
                .servlet("/visits", visits())
                .servlet("/*", greeting()),
        )
        .build()?;
    Ok(engine)
}

fn greeting() -> Arc<dyn Servlet> {
    Arc::new(
        |app: &Application, req: &mut Request, resp: &mut Response| -> anyhow::Result<()> {
            let who = req.remote_user.as_deref().unwrap_or("world");
            resp.set_header("Content-Type", "text/plain");
            resp.write(&format!("Hello, {who}! ({} {})", app.name(), req.servlet_path));
            Ok(())
        },
    )
}

/// Counts visits in the client's session
fn visits() -> Arc<dyn Servlet> {
    Arc::new(
        |app: &Application, req: &mut Request, resp: &mut Response| -> anyhow::Result<()> {
            let session = app.start_session(req, resp)?;
            let mut session = session.lock();
            let count = session.get::<u64>("visits")?.unwrap_or(0) + 1;
            session.set("visits", &count)?;
            resp.write(&format!("visit #{count}"));
            Ok(())
        },
    )
}

fn print_banner() {
    info!("╔═══════════════════════════════════════════════════╗");
    info!("║                                                   ║");
    info!("║   Servlet Engine                                  ║");
    info!("║   pooled dispatch · valve pipeline · sessions     ║");
    info!("║                                                   ║");
    info!("║   one JSON request per line on stdin              ║");
    info!("║                                                   ║");
    info!("╚═══════════════════════════════════════════════════╝");
}
