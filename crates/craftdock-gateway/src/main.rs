use std::net::SocketAddr;
use std::sync::Arc;

use craftdock_core::{Config, ControlSupervisor, EventHub, Reconciler, ServerRegistry};
use craftdock_gateway::{create_app, AppState};
use craftdock_runtime::docker::DockerRuntime;
use craftdock_runtime::ContainerRuntime;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("info,craftdock_gateway=debug")
        .init();

    let config = Config::load();

    let registry = Arc::new(ServerRegistry::connect(&config.database_url).await?);
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(
        config.runtime_config(),
        config.docker_endpoint.as_deref(),
    )?);

    let hub = EventHub::new(runtime.clone());
    let reconciler = Arc::new(Reconciler::new(
        registry.clone(),
        runtime.clone(),
        config.memory_quota_mb,
    ));
    let supervisor = Arc::new(ControlSupervisor::new(
        registry.clone(),
        runtime,
        hub.clone(),
        config.memory_quota_mb,
    ));

    let app = create_app(AppState {
        registry,
        reconciler,
        supervisor,
        hub,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!("Craftdock gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
