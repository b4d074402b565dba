use actix_web::{middleware, web, App, HttpServer};
use meron_api::config::{Settings, DEFAULT_LOG};
use meron_api::server::{self, AppState};
use std::{env, io, process};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: ./meron-api [config file]";

fn get_args() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    if args.len() > 2 || matches!(args.get(1).map(String::as_str), Some("-h" | "--help")) {
        println!("{USAGE}");
        process::exit(1);
    }

    args.get(1).cloned()
}

/// `RUST_LOG` wins over the configured filter
fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let config_file = get_args();
    let settings = match Settings::load(config_file.as_deref()) {
        Ok(settings) => settings,
        Err(err) => {
            init_tracing(DEFAULT_LOG);
            error!("could not load configuration: {err}");
            return Err(io::Error::new(io::ErrorKind::InvalidInput, err));
        }
    };
    init_tracing(&settings.log);

    let state = web::Data::new(AppState::new(
        settings.analyzer(),
        settings.max_body_bytes,
    ));

    info!("listening on http://{}:{}", settings.host, settings.port);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(server::configure)
    })
    .bind((settings.host.as_str(), settings.port))?
    .run()
    .await
}
