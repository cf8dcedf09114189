mod api;
mod catalog;
mod config;
mod coordinator;
mod dispatcher;
mod http_api;
mod mqtt;
mod normalize;
mod resolver;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use api::{AppState, DeviceHandle};
use catalog::Catalog;
use config::{Config, DeviceBinding, TransportMode};
use coordinator::Coordinator;
use dispatcher::{CommandDispatcher, CommandTransport};
use http_api::HttpApiClient;
use mqtt::MqttTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,openwb_bridge=debug")),
        )
        .init();

    tracing::info!("Starting openwb-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("OPENWB_BRIDGE_CONFIG")
        .unwrap_or_else(|_| "openwb-bridge.yaml".to_string());
    let config = Config::load(&config_path)?;
    let catalog = Catalog::load()?;

    let http_client = config
        .http
        .url
        .as_deref()
        .map(|url| Arc::new(HttpApiClient::new(url, config.http.token.clone())));
    let poll_interval = Duration::from_secs(config.http.poll_interval_secs());

    // Build coordinators up front so the MQTT loop sees all of them.
    let mut mqtt_coordinators: Vec<Arc<Coordinator>> = Vec::new();
    let mut devices: Vec<(Arc<Coordinator>, TransportMode)> = Vec::new();
    for device in &config.devices {
        let binding = DeviceBinding::from_config(device, &config.mqtt);
        let coordinator = Arc::new(Coordinator::new(&catalog, binding));
        if device.transport == TransportMode::Mqtt {
            mqtt_coordinators.push(coordinator.clone());
        }
        devices.push((coordinator, device.transport));
    }

    // One shared MQTT connection for every push-mode device.
    let mqtt_transport = if mqtt_coordinators.is_empty() {
        None
    } else {
        let (transport, mut rx) = MqttTransport::connect(&config.mqtt);
        let transport = Arc::new(transport);

        for coordinator in &mqtt_coordinators {
            for topic in coordinator.subscription_topics() {
                transport.subscribe(&topic).await?;
            }
        }
        tracing::info!(
            "MQTT: {} topics for {} devices",
            transport.subscription_count(),
            mqtt_coordinators.len()
        );

        let coordinators = mqtt_coordinators.clone();
        let loop_transport = transport.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                for coordinator in &coordinators {
                    let Some(rebind) = coordinator.apply_message(&message.topic, &message.payload)
                    else {
                        continue;
                    };
                    for topic in &rebind.unsubscribe {
                        if let Err(e) = loop_transport.unsubscribe(topic).await {
                            tracing::warn!("unsubscribe {} failed: {}", topic, e);
                        }
                    }
                    for topic in &rebind.subscribe {
                        if let Err(e) = loop_transport.subscribe(topic).await {
                            tracing::warn!("subscribe {} failed: {}", topic, e);
                        }
                    }
                }
            }
        });
        Some(transport)
    };

    // Hook up dispatchers and, for polled devices, the poll loops.
    let mut handles = Vec::new();
    for (coordinator, transport_mode) in devices {
        let (transport, refresh_tx) = match transport_mode {
            TransportMode::Mqtt => {
                let mqtt = mqtt_transport
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("mqtt transport missing"))?;
                (CommandTransport::Mqtt(mqtt), None)
            }
            TransportMode::Http => {
                let client = http_client
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("http.url missing for a polled device"))?;
                let refresh_tx = coordinator::start_http_poller(
                    coordinator.clone(),
                    client.clone(),
                    poll_interval,
                );
                (CommandTransport::Http(client), Some(refresh_tx))
            }
        };
        let dispatcher =
            Arc::new(CommandDispatcher::new(coordinator.clone(), transport, refresh_tx));
        handles.push(DeviceHandle {
            name: coordinator.label(),
            transport: transport_mode,
            coordinator,
            dispatcher,
        });
    }

    let app_state = Arc::new(AppState { devices: handles });
    let app = api::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let port: u16 = std::env::var("OPENWB_BRIDGE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(config.api_port);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
