use super::App;
use anyhow::{Context, Result};
use las_executor::HostSnapshot;

pub async fn detect(app: &App, dry_run: bool) -> Result<()> {
    println!("Detecting hardware...");
    let snapshot = HostSnapshot::capture().await;
    println!("{}", snapshot.to_concise_string());
    if dry_run {
        return Ok(());
    }

    let path = &app.settings.base_info_path;
    snapshot
        .write(path)
        .with_context(|| format!("Failed to write base info to {}", path.display()))?;
    println!("Base info saved to {}", path.display());
    Ok(())
}
