use std::collections::HashSet;

use admin_sync::{init_tracing, AppState, Dashboard};
use anyhow::{bail, Context};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let state = AppState::load().context("loading saved session")?;
    if !state.has_session() {
        let path = AppState::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "the config directory".to_string());
        bail!("no saved session; sign in and store a token in {}", path);
    }

    let dashboard = Dashboard::init(&state).await?;
    let mut badge = dashboard.chats().unread_badge();
    let mut notifications = dashboard.notifications().watch();
    let mut shown = HashSet::new();
    log::info!("{} unread messages", *badge.borrow());

    loop {
        tokio::select! {
            changed = badge.changed() => {
                if changed.is_err() {
                    break;
                }
                log::info!("{} unread messages", *badge.borrow_and_update());
            }
            changed = notifications.changed() => {
                if changed.is_err() {
                    break;
                }
                let items = notifications.borrow_and_update().clone();
                for item in items.iter().filter(|n| !shown.contains(&n.id)) {
                    log::info!("{}: {}", item.customer_name, item.message.content);
                }
                shown = items.iter().map(|n| n.id).collect();
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutting down");
                break;
            }
        }
    }

    dashboard.dispose();
    Ok(())
}
