use std::{
    io::{self, Write},
    process,
    sync::Arc,
};

use axum::http::{HeaderMap, HeaderValue, header};
use prerender::{
    config::{self, CheckArgs, Command, FetchArgs, Settings},
    error::AppError,
    infra::{error::InfraError, http_client::ReqwestClient, telemetry},
    render::{
        BotGate, EngineDefaults, GateMatch, NetworkOnly, PageRenderer, PassthroughEngine,
        RenderBridge, RenderRequest,
    },
};
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Check(args) => run_check(&settings, args),
        Command::Fetch(args) => run_fetch(&settings, args).await,
    }
}

fn run_check(settings: &Settings, args: CheckArgs) -> Result<(), AppError> {
    let gate = BotGate::from_settings(&settings.renderer)?;

    let mut headers = HeaderMap::new();
    if let Some(agent) = args.user_agent.as_deref() {
        let value = HeaderValue::from_str(agent)
            .map_err(|err| AppError::validation(format!("invalid user agent: {err}")))?;
        headers.insert(header::USER_AGENT, value);
    }

    let (reason, rule) = match gate.matching(&args.path, &headers) {
        Some(GateMatch::ForcePath(rule)) => (Some("force_path"), Some(rule)),
        Some(GateMatch::Agent(rule)) => (Some("agent"), Some(rule)),
        None => (None, None),
    };

    let verdict = json!({
        "target": args.path,
        "user_agent": args.user_agent,
        "render": reason.is_some(),
        "reason": reason,
        "rule": rule,
    });
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{verdict:#}").map_err(InfraError::from)?;
    Ok(())
}

async fn run_fetch(settings: &Settings, args: FetchArgs) -> Result<(), AppError> {
    let url = Url::parse(&args.url)
        .map_err(|err| AppError::validation(format!("invalid url `{}`: {err}", args.url)))?;

    let renderer_settings = &settings.renderer;
    let outbound = ReqwestClient::new(
        &settings.http_client,
        renderer_settings.max_body_bytes.get(),
    )?;
    let bridge = RenderBridge::new(Arc::new(NetworkOnly), Arc::new(outbound))
        .with_user_agent(renderer_settings.user_agent.clone())
        .with_follow_redirects(settings.http_client.follow_redirects)
        .with_max_body_bytes(renderer_settings.max_body_bytes.get());
    let renderer = PageRenderer::new(
        Arc::new(PassthroughEngine),
        Arc::new(bridge),
        EngineDefaults::from(renderer_settings),
    );

    let mut request = RenderRequest::get(url.clone());
    if let Some(agent) = args.user_agent.as_deref() {
        let value = HeaderValue::from_str(agent)
            .map_err(|err| AppError::validation(format!("invalid user agent: {err}")))?;
        request = request.with_header(header::USER_AGENT, value);
    }

    let bytes = renderer.render(request).await?;
    info!(target = "prerender::cli", %url, bytes = bytes.len(), "fetch complete");

    let mut stdout = io::stdout().lock();
    if args.print {
        stdout.write_all(&bytes).map_err(InfraError::from)?;
    } else {
        let summary = json!({ "url": url.as_str(), "bytes": bytes.len() });
        writeln!(stdout, "{summary:#}").map_err(InfraError::from)?;
    }
    Ok(())
}
