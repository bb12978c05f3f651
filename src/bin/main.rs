use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::json;

use msb::config::MsbConfig;
use msb::{
    HandlerResult, Message, MsbContext, MsbResult, RequestOptions, ResponderContext,
    ResponderOptions,
};

const LOG_TARGET: &str = "msb::demo";

/// Request/response conversations over a pub/sub broker
#[derive(Parser)]
#[command(name = "msb")]
#[command(version)]
#[command(about = "Request/response conversations over a pub/sub broker")]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one conversation against an in-memory responder and print how it ended
    Demo(DemoArgs),
}

#[derive(Args)]
struct DemoArgs {
    /// Namespace the responder listens on
    #[arg(long, default_value = "demo:echo")]
    namespace: String,

    /// Responses the responder announces in its ack and then sends
    #[arg(long, default_value_t = 1)]
    responses: u32,

    /// Responses the requester waits for (0: none, -1: until timeout)
    #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
    wait_for_responses: i32,

    /// Response timeout (default: defaultResponseTimeoutMs from the config)
    #[arg(long)]
    response_timeout_ms: Option<u64>,

    /// Window during which acks keep the conversation open
    #[arg(long)]
    ack_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match MsbConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => MsbConfig::default(),
    };

    match cli.command {
        Commands::Demo(args) => {
            if let Err(e) = run_demo(config, args).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run_demo(config: MsbConfig, args: DemoArgs) -> MsbResult<()> {
    let context = MsbContext::new(config)?;

    let responses = args.responses;
    let server = context.responder_server(
        args.namespace.as_str(),
        ResponderOptions::default(),
        move |request: &Message, ctx: &ResponderContext| -> HandlerResult {
            let responder = ctx.responder();
            responder.send_ack(None, Some(i32::try_from(responses)?))?;
            for index in 0..responses {
                responder.send(&json!({ "index": index, "echo": request.payload }))?;
            }
            Ok(())
        },
    );
    server.listen()?;

    let mut options = RequestOptions::default().with_wait_for_responses(args.wait_for_responses);
    if let Some(timeout) = args.response_timeout_ms {
        options = options.with_response_timeout(Duration::from_millis(timeout));
    }
    if let Some(timeout) = args.ack_timeout_ms {
        options = options.with_ack_timeout(Duration::from_millis(timeout));
    }

    let requester = context
        .requester(args.namespace.as_str(), options)
        .on_acknowledge(|ack, _| {
            log::info!(
                target: LOG_TARGET,
                "Ack from {}: {:?} more responses, timeout {:?} ms",
                ack.responder_id,
                ack.responses_remaining,
                ack.timeout_ms
            )
        })
        .on_response(|message| {
            log::info!(target: LOG_TARGET, "Response {}: {:?}", message.id, message.payload)
        });

    let outcome = match requester.publish(&json!({ "hello": "world" })) {
        Ok(Some(conversation)) => match conversation.finished().await {
            Ok(end) => serde_json::to_string_pretty(&end).map_err(Into::into),
            Err(e) => Err(e),
        },
        Ok(None) => Ok(json!({ "published": true, "waited": false }).to_string()),
        Err(e) => Err(e),
    };

    context.shutdown();
    println!("{}", outcome?);
    Ok(())
}
