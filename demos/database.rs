use std::time::Duration;

use letterbox::{
    Bus, BusConfig, Message,
    handler::json::{JsonDelivery, JsonLayer},
    handler_fn,
    store::sqlx::PgStore,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Greeting {
    id: i32,
    text: String,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let config = BusConfig::from_env()
        .expect("invalid configuration")
        .with_forwarder();
    let store = PgStore::connect(&config.database_url, config.max_connections)
        .await
        .expect("failed to connect to postgres");
    let bus = Bus::new(store.clone(), config)
        .await
        .expect("failed to create bus");

    let cancel = CancellationToken::new();
    bus.start_forwarder(&cancel)
        .await
        .expect("failed to start forwarder");

    let handler = handler_fn(|delivery: JsonDelivery<Greeting>| async move {
        tracing::info!(
            id = delivery.body.id,
            attempt = delivery.delivery.attempt(),
            "{}",
            delivery.body.text
        );
        Ok::<_, tower::BoxError>(())
    })
    .layer(JsonLayer::<Greeting>::new());
    let mut errors = bus
        .subscribe("greetings", handler)
        .await
        .expect("failed to subscribe");

    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let mut id = 0;
    loop {
        let greeting = Greeting {
            id,
            text: "Hello".to_owned(),
        };
        let mut tx = store.begin().await.expect("failed to begin transaction");
        bus.publish_in_tx(
            &mut tx,
            "greetings",
            [Message::json(&greeting).expect("greeting is serializable")],
        )
        .await
        .expect("failed to publish");
        tx.commit().await.expect("failed to commit");
        id += 1;

        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(err) = errors.recv() => tracing::error!(%err, "greeting dropped"),
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }
    }

    if let Err(err) = bus.shutdown().await {
        tracing::error!(%err, "shutdown failed");
    }
}
