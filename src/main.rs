#![forbid(unsafe_code)]

use std::sync::Arc;

use aquaflux::{
    api::{self, Context},
    config::{self, gemini_api_key},
    db_pool,
    extraction::RetryPolicy,
    model::GeminiProvider,
    Config, OpenDatabaseError,
};
use dotenvy::dotenv;
use log::{info, warn};

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Could not load configuration")]
    Config(#[from] config::Error),

    #[error("Could not open database")]
    OpenDatabase(#[from] OpenDatabaseError),

    #[error("Could not bind to address")]
    Bind(#[source] warp::Error),
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    pretty_env_logger::init_timed();
    dotenv().ok();

    Ok(run().await?)
}

async fn run() -> Result<(), Error> {
    let config = Config::from_env()?;

    info!("Opening database");
    let pool = db_pool(&config.database_url).await?;

    if gemini_api_key().is_none() {
        warn!("Gemini API key is not set, image analysis and advice will fail");
    }
    info!("Using model {}", config.gemini.model);

    let ctx = Context {
        pool: pool.clone(),
        models: Arc::new(GeminiProvider::new(config.gemini)),
        retry: RetryPolicy::default(),
    };

    let (addr, server) = warp::serve(api::routes(ctx))
        .try_bind_with_graceful_shutdown(config.bind, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down");
        })
        .map_err(Error::Bind)?;

    info!("Listening on http://{addr}");
    server.await;

    pool.close().await;

    Ok(())
}
