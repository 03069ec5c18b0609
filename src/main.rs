use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use scylla_event_engine::domain::order::{OrderAggregate, OrderCommand, OrderCommandHandler, OrderItem, OrderShippedV1Upcaster};
use scylla_event_engine::event_sourcing::core::{AggregateId, JsonEventSerializer};
use scylla_event_engine::event_sourcing::store::{Repository, ScyllaEventStore};
use scylla_event_engine::metrics::{self, Metrics};
use scylla_event_engine::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,scylla_event_engine=debug"))
        )
        .init();

    let config = EngineConfig::from_env()?;
    tracing::info!(?config, "🚀 Starting event engine demo");

    // === 1. Create ScyllaDB Session ===
    tracing::info!(node = %config.scylla_node, "Connecting to ScyllaDB...");
    let session: Session = SessionBuilder::new()
        .known_node(&config.scylla_node)
        .build()
        .await?;

    // Keyspace name is validated by EngineConfig
    session
        .query_unpaged(
            format!(
                "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                 {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
                config.keyspace
            ),
            &[],
        )
        .await?;

    session.use_keyspace(&config.keyspace, false).await?;

    let session = Arc::new(session); // Wrap for sharing

    let store = Arc::new(ScyllaEventStore::new(session.clone()));
    store.ensure_schema().await?;

    // === 2. Initialize Prometheus metrics ===
    let metrics = Arc::new(Metrics::new()?);
    tracing::info!("📊 Metrics registry created");

    // actix-web wants its own system; run it on a dedicated thread
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(metrics_registry, metrics_port)) {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    // === 3. Wire repository and command handler ===
    let serializer = JsonEventSerializer::new()
        .with_upcaster("OrderShipped", Arc::new(OrderShippedV1Upcaster));

    let repository = Repository::<OrderAggregate, _>::with_serializer(
        store,
        Arc::new(serializer),
        Arc::new(config.snapshot_behavior()?),
        config.unhandled_events,
    )?
    .with_archive_behavior(config.archive_behavior)
    .with_metrics(metrics.clone());

    let handler = OrderCommandHandler::new(Arc::new(repository)).with_metrics(metrics.clone());

    // === 4. Demonstrate full order lifecycle ===
    tracing::info!("📝 Demonstrating order lifecycle");

    let order_id = AggregateId::from(Uuid::new_v4());
    let correlation_id = Uuid::new_v4();

    handler
        .handle(
            &order_id,
            OrderCommand::CreateOrder {
                customer_id: Uuid::new_v4(),
                items: vec![
                    OrderItem { product_id: Uuid::new_v4(), quantity: 2 },
                    OrderItem { product_id: Uuid::new_v4(), quantity: 1 },
                ],
            },
            correlation_id,
        )
        .await?;
    tracing::info!("✅ Order created: {}", order_id);

    handler
        .handle(
            &order_id,
            OrderCommand::UpdateItems {
                items: vec![OrderItem { product_id: Uuid::new_v4(), quantity: 5 }],
                reason: Some("Customer added items".to_string()),
            },
            correlation_id,
        )
        .await?;

    handler.handle(&order_id, OrderCommand::ConfirmOrder, correlation_id).await?;

    handler
        .handle(
            &order_id,
            OrderCommand::ShipOrder {
                tracking_number: "TRACK-0001".to_string(),
                carrier: "DHL".to_string(),
            },
            correlation_id,
        )
        .await?;

    let version = handler
        .handle(&order_id, OrderCommand::DeliverOrder { signature: None }, correlation_id)
        .await?;

    let order = handler.load(&order_id).await?;
    tracing::info!(
        order_id = %order_id,
        version = version,
        status = ?order.status,
        quantity = order.total_quantity(),
        "🎉 Demo complete"
    );

    Ok(())
}
