use crate::{configuration::Configuration, types::StatusPolicy};
use clap::Parser;
use std::path::PathBuf;
use tracing::warn;

const DEFAULT_PASSWORD: &str = "admin123";

/// Command line arguments, each falling back to an environment variable.
/// A `.env` file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Booking and admin API for a braiding studio")]
pub struct ConfigurationHandler {
    /// Title shown on the booking page
    #[arg(long, env = "WEBSITE_TITLE", default_value = "Braid Studio")]
    website_title: String,

    /// Password expected in the `x-admin-password` header of admin requests
    #[arg(long, env = "ADMIN_PASSWORD", default_value = DEFAULT_PASSWORD)]
    password: String,

    /// HTML file served as the booking page
    #[arg(long, env = "FRONTEND_PATH", default_value = "../frontend/index.html")]
    frontend_path: PathBuf,

    /// PostgreSQL connection URL. Without it bookings are kept in memory only
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "PORT", default_value = "3000")]
    port: String,

    /// Only allow pending -> confirmed -> completed, or cancelling an open appointment
    #[arg(long, env = "STRICT_STATUS_TRANSITIONS")]
    strict_status_transitions: bool,
}

impl ConfigurationHandler {
    pub fn parse_arguments() -> Self {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                warn!(%err, "Failed to load .env file");
            }
        }
        let configuration = Self::parse();
        if configuration.password == DEFAULT_PASSWORD {
            warn!("ADMIN_PASSWORD not set. Using the default password, change it in production");
        }
        configuration
    }
}

impl Configuration for ConfigurationHandler {
    fn website_title(&self) -> String {
        self.website_title.clone()
    }

    fn password(&self) -> String {
        self.password.clone()
    }

    fn frontend_path(&self) -> PathBuf {
        self.frontend_path.clone()
    }

    fn database_url(&self) -> Option<String> {
        self.database_url.clone()
    }

    fn port(&self) -> String {
        self.port.clone()
    }

    fn status_policy(&self) -> StatusPolicy {
        if self.strict_status_transitions {
            StatusPolicy::Lifecycle
        } else {
            StatusPolicy::Unrestricted
        }
    }
}
