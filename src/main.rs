use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;
use std::time::Duration;

use tip_settlement::api::{self, ApiDoc};
use tip_settlement::config::Config;
use tip_settlement::notify::EventNotifier;
use tip_settlement::settlement::stream::subscribe_to_confirmations;
use tip_settlement::settlement::{PendingTxLog, Settlement};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

// Drop pending replies whose transfer never confirmed
fn spawn_pending_sweep(pending: PendingTxLog, ttl: Duration) -> anyhow::Result<()> {
    let ttl = chrono::Duration::from_std(ttl).context("PENDING_TX_TTL_SECS out of range")?;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match pending.sweep_expired(ttl) {
                Ok(0) => {}
                Ok(removed) => info!("Expired {} pending transactions", removed),
                Err(err) => error!("Pending transaction sweep failed: {}", err),
            }
        }
    });
    Ok(())
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env()?;
    let settlement = Settlement::from_config(&config)?;

    let confirmations = subscribe_to_confirmations(config.node_ws_url.as_deref())?;
    let notifier = Arc::new(EventNotifier::new(config.event_webhook_url.clone(), config.rpc_timeout)?);
    settlement.engine.subscribe_to_confirmed_tx(confirmations, notifier);

    spawn_pending_sweep(settlement.pending.clone(), config.pending_tx_ttl)?;

    let storage = settlement.storage.clone();
    let settlement = web::Data::new(settlement);

    info!("Starting HTTP server at http://{}", config.bind_addr);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(settlement.clone())
            .configure(api::configure_routes)
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()))
    })
    .bind(config.bind_addr.as_str())?
    .run()
    .await?;

    storage.flush()?;
    Ok(())
}
