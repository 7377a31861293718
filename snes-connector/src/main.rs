mod tracing_helper;

use std::{env::args, time::Duration};

use anyhow::Result;
use snes_connector_lib::{
    AddressFormat, ConnectorService, ConnectorSettings, MemoryDomain, MemoryRequest,
    RecurringMemoryRequest, ServiceEvent,
};
use tokio::{select, signal::ctrl_c, sync::broadcast::error::RecvError};
use tracing::{info, warn};

const DEFAULT_SETTINGS_PATH: &str = "snes-connector.toml";

fn demo_subscriptions() -> Vec<RecurringMemoryRequest> {
    vec![
        RecurringMemoryRequest::new(
            MemoryRequest::retrieve(
                0x7E0010,
                2,
                MemoryDomain::ConsoleRam,
                AddressFormat::LinearOffset,
            )
            .with_callback(|data| info!("Game mode: {:?}", data.read_u16(0))),
            Duration::from_millis(500),
        ),
        RecurringMemoryRequest::new(
            MemoryRequest::retrieve(
                0xA06000,
                0x10,
                MemoryDomain::CartridgeSave,
                AddressFormat::LinearOffset,
            )
            .with_callback(|data| info!("Save RAM changed: {:02X?}", data.raw())),
            Duration::from_secs(2),
        )
        .on_change_only(),
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_helper::init_tracing()?;

    let path = args().nth(1).unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_owned());
    let settings = ConnectorSettings::load(&path).await?;
    info!("Loaded settings from {}: {:?}", path, settings);

    let service = ConnectorService::with_default_connectors();
    let mut events = service.subscribe();
    for subscription in demo_subscriptions() {
        service.add_recurring_memory_request(subscription)?;
    }
    service.connect(&settings).await;

    loop {
        select! {
            result = ctrl_c() => {
                result?;
                break;
            }
            event = events.recv() => match event {
                Ok(ServiceEvent::Connected(connector_type)) => {
                    info!("Connected via {:?}: {:?}", connector_type, service.capabilities());
                }
                Ok(ServiceEvent::GameDetected(connector_type)) => {
                    info!("Game detected via {:?}", connector_type);
                }
                Ok(ServiceEvent::Disconnected(connector_type)) => {
                    warn!("Lost connection via {:?}", connector_type);
                }
                Err(RecvError::Lagged(count)) => warn!("Missed {} service events", count),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutting down");
    service.clear_recurring_memory_requests();
    service.disconnect().await;
    Ok(())
}
