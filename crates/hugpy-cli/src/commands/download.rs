use anyhow::{Result, anyhow};
use hugpy_core::{Settings, download, locator};

pub fn run(name: &str) -> Result<()> {
    let settings = Settings::load();

    let repo_id = match settings.model(name) {
        Some(entry) => entry
            .repo_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("'{}' has no remote repo id configured", name))?,
        None if locator::is_valid_repo_id(name) => name.to_string(),
        None => {
            return Err(anyhow!(
                "Unknown model '{}'. Use a configured name or a namespace/repo id",
                name
            ));
        }
    };

    download::download_snapshot(&repo_id, &settings.cache_dir())?;
    Ok(())
}
