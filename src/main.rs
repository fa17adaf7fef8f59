use std::{process::exit, sync::Arc};

use actix_web::{middleware::DefaultHeaders, web::Data, App, HttpServer};
use actix_web_httpauth::middleware::HttpAuthentication;
use drogue_dm::{
    server::{check_password, hash_password, routes},
    DownloadManager, ServerConfig,
};
use tracing::{error, info};
use tracing_subscriber::{
    fmt::format::FmtSpan, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
    EnvFilter,
};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    let Some(hash) = config.password.as_deref().and_then(hash_password) else {
        error!("No password set, please set the DROGUE_DM_PASSWORD environment variable.");
        exit(1);
    };
    let hash = Arc::new(hash);

    // Downloads, activity and settings live in the store, so everything
    // picks up where it was after a restart.
    let manager = match DownloadManager::launch(config.engine.clone()).await {
        Ok(manager) => manager,
        Err(err) => {
            error!("Failed to start the download engine: {}", err);
            exit(1);
        }
    };
    match manager.resume_interrupted_downloads().await {
        Ok(report) => info!(
            "Recovery finished, {} resumed and {} failed",
            report.resumed.len(),
            report.failed.len()
        ),
        Err(err) => error!("Failed to resume interrupted downloads: {}", err),
    }

    info!("Listening on {}", config.bind_address);
    let data = Data::new(manager.clone());
    let served = HttpServer::new(move || {
        let hash = hash.clone();
        let auth = HttpAuthentication::basic(move |req, credentials| {
            check_password(req, credentials, hash.clone())
        });
        App::new()
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Frame-Options", "DENY"))
                    .add(("Content-Security-Policy", "default-src 'none'")),
            )
            .wrap(auth)
            .app_data(data.clone())
            .configure(routes)
    })
    .bind(&config.bind_address)?
    .workers(1)
    .run()
    .await;

    manager.shutdown();
    served
}
