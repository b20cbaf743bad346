use std::sync::Arc;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tracing::error;
use url::Url;

pub use machinepool_operator::{self, telemetry, State};
use machinepool_operator::cloud::HttpFleetGateway;
use machinepool_operator::controllers::ReconcilerConfig;
use machinepool_operator::telemetry::LogFormat;

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Base URL of the fleet API that owns autoscaling groups and launch templates
    #[arg(long = "fleet-api-url", env = "FLEET_API_URL", value_name = "URL")]
    fleet_api_url: Url,

    #[arg(long = "fleet-api-token", env = "FLEET_API_TOKEN", hide_env_values = true)]
    fleet_api_token: Option<String>,

    /// Track every fleet instance with an AwsMachine object
    #[arg(
        long = "machine-pool-machines",
        env = "FEATURE_MACHINE_POOL_MACHINES",
        default_value_t = false
    )]
    machine_pool_machines: bool,

    /// Only reconcile pools in this namespace
    #[arg(long = "watch-namespace", env = "WATCH_NAMESPACE", value_name = "NAMESPACE")]
    watch_namespace: Option<String>,

    #[arg(long = "log-format", env = "LOG_FORMAT", value_enum, default_value_t)]
    log_format: LogFormat,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => {
            error!("Failed to encode metrics: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Arguments = Arguments::parse();

    telemetry::init(args.log_format)?;

    let gateway = HttpFleetGateway::new(args.fleet_api_url, args.fleet_api_token)?;

    // Initialize Kubernetes controller state
    let state = State::new(
        Arc::new(gateway),
        ReconcilerConfig {
            machine_pool_machines: args.machine_pool_machines,
        },
        args.watch_namespace,
    );
    let controller = machinepool_operator::run(state.clone());
    tokio::pin!(controller);

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind("0.0.0.0:8080")?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(server);

    // Both runtimes implements graceful shutdown, so poll until both are done
    tokio::join!(controller, server).1?;
    Ok(())
}
