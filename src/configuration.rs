use crate::types::StatusPolicy;
use std::path::PathBuf;

/// Settings the server reads at startup and per request.
pub trait Configuration: Clone + Send + Sync + 'static {
    fn website_title(&self) -> String;
    /// Expected value of the admin password header.
    fn password(&self) -> String;
    fn frontend_path(&self) -> PathBuf;
    /// Bookings live in memory when this is `None`.
    fn database_url(&self) -> Option<String>;
    fn port(&self) -> String;
    fn status_policy(&self) -> StatusPolicy;
}
