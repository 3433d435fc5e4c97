//! MCP Probe - drive an MCP server through a scripted session
//!
//! Prints the wire exchange of each stage on stdout; logs go to stderr.

use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use tracing::{error, info};

use mcp_probe::{
    cli::Cli,
    client::{ClientOptions, McpClient},
    config::Config,
    scenario::{Scenario, StageReport, StageStatus},
    session::{Session, Target},
    setup_tracing,
    transport::HttpClient,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let Some(target) = cli.target.clone() else {
        eprintln!("{}", Cli::command().render_usage());
        return ExitCode::FAILURE;
    };

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = cli.apply(&mut config) {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let base = match config.server.url() {
        Ok(url) => url,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let target = match Target::parse(&target, &base) {
        Ok(t) => t,
        Err(e) => {
            error!("Invalid target '{target}': {e}");
            return ExitCode::FAILURE;
        }
    };

    let http = match HttpClient::from_config(&config) {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to create HTTP client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let scenario = Scenario::from_config(&config.scenario);
    let options = ClientOptions::from_config(&config);

    match target {
        Target::Server(url) => run_session(&config, &cli, http, &url, &scenario, options).await,
        Target::Attach(session) => run_attached(http, &session, &scenario, &options).await,
    }
}

/// Full session: connect, run every stage, optionally tail the stream
async fn run_session(
    config: &Config,
    cli: &Cli,
    http: HttpClient,
    url: &url::Url,
    scenario: &Scenario,
    options: ClientOptions,
) -> ExitCode {
    let kind = config.server.transport_for(url);
    info!(url = %url, transport = %kind, "Connecting");

    let mut client = match McpClient::connect(http, url, kind, options, config.timeouts.endpoint).await {
        Ok(c) => c,
        Err(e) => {
            error!("❌ Connection failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(session) = client.session() {
        println!("🔗 Session {} ({kind})", session.id());
    }

    let outcome = scenario.run(&mut client, print_stage).await;

    let code = match outcome {
        Ok(report) => {
            if let Some(session) = &report.session_id {
                info!(session_id = %session, "Session used");
            }
            if report.application_errors() > 0 {
                println!("⚠️  {} stage(s) returned JSON-RPC errors", report.application_errors());
            }
            println!("✅ Completed {} stage(s)", report.stages.len());

            if cli.listen {
                listen(&mut client).await
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("❌ Run aborted: {e}");
            ExitCode::FAILURE
        }
    };

    if let Err(e) = client.close().await {
        error!("Failed to close session: {e}");
    }
    code
}

/// Print unsolicited messages until the stream closes or Ctrl-C
async fn listen(client: &mut McpClient) -> ExitCode {
    println!("👂 Listening for server messages (Ctrl-C to stop)");
    loop {
        tokio::select! {
            message = client.next_message() => match message {
                Ok(Some(message)) => print_json(&message),
                Ok(None) => {
                    info!("Event stream closed");
                    return ExitCode::SUCCESS;
                }
                Err(e) => {
                    error!("❌ Event stream failed: {e}");
                    return ExitCode::FAILURE;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return ExitCode::SUCCESS;
            }
        }
    }
}

/// Attach mode: post every stage to a session negotiated elsewhere
async fn run_attached(
    http: HttpClient,
    session: &Session,
    scenario: &Scenario,
    options: &ClientOptions,
) -> ExitCode {
    println!("🔗 Posting to existing session {}", session.id());
    match scenario
        .dispatch_detached(&http, session, options, print_stage)
        .await
    {
        Ok(report) => {
            println!("✅ Posted {} stage(s)", report.stages.len());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Run aborted: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_stage(report: &StageReport) {
    let marker = match report.status {
        StageStatus::Ok | StageStatus::Sent => "▶",
        StageStatus::ApplicationError => "⚠️ ",
        StageStatus::Failed => "❌",
    };
    println!("\n{marker} {} ({}ms)", report.stage, report.elapsed_ms);
    print_json(report);
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("❌ Failed to serialize to JSON: {e}"),
    }
}
