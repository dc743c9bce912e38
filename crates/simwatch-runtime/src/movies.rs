use anyhow::{Context, Result};
use simwatch_store::{Folder, StoreClient};

use crate::fetch::{MOVIES_FOLDER, TIMESTEPS_FOLDER};

/// Requests one movie per format for every variable item under `run_folder`.
/// Returns the number of requests made.
pub async fn create_movies(
    store: &StoreClient,
    run_folder: &Folder,
    formats: &[String],
) -> Result<usize> {
    let groups = store
        .list_folders(&run_folder.id)
        .await
        .with_context(|| format!("listing groups of run {}", run_folder.name))?;

    let mut requested = 0usize;
    for group in groups
        .iter()
        .filter(|f| f.name != TIMESTEPS_FOLDER && f.name != MOVIES_FOLDER)
    {
        let items = store
            .list_items(&group.id)
            .await
            .with_context(|| format!("listing variables of group {}", group.name))?;
        for item in &items {
            tracing::info!(
                event = "movie_requested",
                group = %group.name,
                variable = %item.name,
                "creating movies"
            );
            for format in formats {
                store
                    .request_movie(item, format)
                    .await
                    .with_context(|| format!("requesting {format} movie for {}", item.name))?;
                requested += 1;
            }
        }
    }
    Ok(requested)
}
