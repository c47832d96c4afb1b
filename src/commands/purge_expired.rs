use tracing::{info, warn};

use crate::storage::AnyStore;
use crate::App;

pub async fn run(app: App) -> anyhow::Result<()> {
    let Some(pastes) = &app.pastes else {
        warn!("no storage configured, doing nothing");
        return Ok(());
    };

    match pastes.backend() {
        AnyStore::File(file) => {
            let count = file.purge_evicted().await?;
            info!("purged {count} evicted entries");
        }
        _ => warn!("this storage evicts expired entries on its own, doing nothing"),
    }

    Ok(())
}
