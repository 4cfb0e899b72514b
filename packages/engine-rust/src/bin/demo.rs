//! # soapflow demo
//!
//! Deploys an echo service on an in-process server engine and calls it from
//! a client engine over the loopback transport, either blocking or with a
//! callback.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use soapflow_core::{Fault, Flow, HandlerFlow, PhaseRule, QName};
use soapflow_engine::client::{callback_fn, Call, CallError, LoopbackTransport};
use soapflow_engine::handlers::{handler_fn, EchoHandler, LoggingHandler};
use soapflow_engine::logging::{init_tracing, LogFormat};
use soapflow_engine::{DispatchEngine, EngineConfig, HandlerSpec, ServiceSpec};
use tracing::{error, info};

const SERVICE: &str = "EchoXMLService";
const OPERATION: &str = "echoOMElement";

#[derive(Parser, Debug)]
#[command(name = "soapflow-demo")]
#[command(about = "Send a message through a loopback soapflow service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Message body to echo
    #[arg(short, long, default_value = "Isaac Asimov, The Foundation Trilogy")]
    message: String,

    /// Use a callback instead of waiting for the response
    #[arg(long)]
    non_blocking: bool,

    /// Make the server reject the message with a BadInput fault
    #[arg(long)]
    reject: bool,

    /// Absorb BadInput faults on the server instead of returning them
    #[arg(long)]
    absorb: bool,

    /// JSON engine configuration applied to both engines
    #[arg(short, long, env = "SOAPFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn server(config: EngineConfig, cli: &Cli) -> anyhow::Result<Arc<DispatchEngine>> {
    let engine = Arc::new(DispatchEngine::new(EngineConfig {
        engine_id: format!("{}-server", config.engine_id),
        ..config
    })?);
    engine.engage(
        Flow::In,
        HandlerSpec::named("ServerLog", Arc::new(LoggingHandler::new("server-in")), PhaseRule::new("transport")),
    )?;

    let mut service = ServiceSpec::new(SERVICE)
        .operation(OPERATION)
        .handler(
            Flow::In,
            HandlerSpec::named("Echo", Arc::new(EchoHandler), PhaseRule::new("service")),
        );
    if cli.reject {
        service = service.handler(
            Flow::In,
            HandlerSpec::named(
                "Validate",
                handler_fn(|_ctx| {
                    Err(Fault::new(QName::new("urn:soapflow:demo", "BadInput"), "message rejected"))
                }),
                PhaseRule::new("service").before("Echo"),
            ),
        );
    }
    if cli.absorb {
        service = service.handler(
            Flow::Fault,
            HandlerSpec::named(
                "Apologize",
                handler_fn(|ctx| {
                    ctx.response = Some("sorry, try another message".into());
                    Ok(HandlerFlow::Continue)
                }),
                PhaseRule::new("service"),
            )
            .with_option("fault-BadInput", "apologize"),
        );
    }
    engine.deploy(service)?;
    Ok(engine)
}

fn client(config: EngineConfig) -> anyhow::Result<Arc<DispatchEngine>> {
    let engine = Arc::new(DispatchEngine::new(EngineConfig {
        engine_id: format!("{}-client", config.engine_id),
        ..config
    })?);
    engine.deploy(
        ServiceSpec::new(SERVICE)
            .handler(
                Flow::Out,
                HandlerSpec::new(Arc::new(LoggingHandler::new("client-out")), PhaseRule::new("global")),
            )
            .handler(
                Flow::In,
                HandlerSpec::new(Arc::new(LoggingHandler::new("client-in")), PhaseRule::new("global")),
            ),
    )?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    let config = load_config(cli.config.as_ref())?;
    let server = server(config.clone(), &cli)?;
    let client = client(config)?;
    let call = Call::new(
        Arc::clone(&client),
        Arc::new(LoopbackTransport::new(Arc::clone(&server))),
        SERVICE,
    );

    if cli.non_blocking {
        let pending = call.invoke_non_blocking(
            OPERATION,
            cli.message.clone(),
            callback_fn(|result| match result {
                Ok(response) => info!(
                    body = response.response_payload().as_str().unwrap_or("<binary>"),
                    "callback received response"
                ),
                Err(e) => error!(error = %e, "callback received error"),
            }),
        );
        info!(message_id = %pending.message_id(), "request sent, waiting for callback");
        let status = pending.wait().await;
        info!(status = ?status, "call finished");
    } else {
        match call.invoke_blocking(OPERATION, cli.message.clone()).await {
            Ok(response) => println!("{}", response.payload.as_str().unwrap_or("<binary>")),
            Err(CallError::Fault(fault)) => {
                println!("fault {}: {}", fault.code, fault.reason);
            }
            Err(e) => return Err(e.into()),
        }
    }

    client.shutdown();
    server.shutdown();
    Ok(())
}
