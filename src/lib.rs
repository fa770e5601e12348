use std::sync::Arc;

use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use config::Config;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod config;
pub mod dead_letter;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod reclaim;
pub mod registry;
pub mod retry;
pub mod service;
pub mod store;

pub use error::Error;
pub use message::{Message, MessageStatus, NewMessage, Priority};
pub use registry::{Context, Handler};
pub use service::Service;

/// Returns a builder for the queue server.
///
/// `handlers` are subscribed before the background loops start.
#[bon::builder(finish_fn = start)]
pub async fn run(#[builder(default)] handlers: Vec<(String, Arc<dyn Handler>)>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TEMPOQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TEMPOQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = Config::load()?;
    let bind = config.bind.clone();

    let service = Service::connect_with().config(config).call().await?;

    for (topic, handler) in handlers {
        service.subscribe_shared(topic, handler).await?;
    }

    service.start()?;

    let data = Data::new(service);

    let server = HttpServer::new({
        let data = data.clone();
        move || {
            let json_cfg = JsonConfig::default().content_type_required(false);

            App::new()
                .wrap(TracingLogger::default())
                .wrap(NormalizePath::new(TrailingSlash::Trim))
                .service(api::queue::service())
                .service(api::admin::service())
                .app_data(data.clone())
                .app_data(json_cfg)
        }
    })
    .bind(&bind)?
    .run();

    tracing::info!(bind, "Listening");

    let res = server.await;

    data.close().await?;

    res?;

    Ok(())
}
