pub mod api;
pub mod app;
pub mod chat;
pub mod dashboard;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod status;
pub mod timer;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use app::AppState;
pub use dashboard::Dashboard;
pub use error::SyncError;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the log backend. `log` records from the library are bridged in.
pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
