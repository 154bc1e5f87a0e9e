use std::{sync::Arc, time::Duration};

use crate::{
    backend::BookingBackend,
    clock::{Clock, LocalClock},
    configuration::Configuration,
    configuration_handler::ConfigurationHandler,
    database_interface::DatabaseInterface,
    http::create_app,
    local_bookings::LocalBookings,
};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod backend;
mod catalog;
mod clock;
mod configuration;
mod configuration_handler;
mod database_interface;
mod error;
mod http;
mod local_bookings;
mod models;
mod reservation;
mod schema;
#[cfg(test)]
mod testutils;
mod types;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct AppState<T: BookingBackend, C: Configuration> {
    backend: T,
    configuration: C,
    clock: Arc<dyn Clock>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let configuration = ConfigurationHandler::parse_arguments();
    let clock: Arc<dyn Clock> = Arc::new(LocalClock);

    let address = format!("0.0.0.0:{}", configuration.port());
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(%address, title = %configuration.website_title(), "Booking service listening");

    let app = if let Some(database_url) = configuration.database_url() {
        let backend = loop {
            match DatabaseInterface::new(&database_url) {
                Ok(backend) => {
                    info!("Connected to database");
                    break backend;
                }
                Err(err) => {
                    error!(
                        %err,
                        "Failed to connect to database. Retrying in 1 sec. \
                         Unset DATABASE_URL to keep bookings in memory instead."
                    );
                    sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        };
        create_app(backend, configuration, clock)
    } else {
        warn!("No database configured, bookings are kept in memory only");
        create_app(LocalBookings::with_default_catalog(), configuration, clock)
    };

    axum::serve(listener, app).await
}
