use anyhow::Result;
use hugpy_core::{Settings, download, locator};

pub fn run() -> Result<()> {
    let settings = Settings::load();
    let cache_dir = settings.cache_dir();

    println!("Configured models:");
    println!();
    for (name, entry) in &settings.models {
        let local = entry
            .path
            .as_deref()
            .map(|path| {
                let status = if locator::is_model_dir(path) {
                    "[installed]"
                } else {
                    "[missing]"
                };
                format!("{} {}", path.display(), status)
            })
            .unwrap_or_else(|| "-".to_string());
        let remote = entry
            .repo_id
            .as_deref()
            .map(|repo_id| {
                let status = if download::cached_snapshot(&cache_dir, repo_id).is_some() {
                    " [cached]"
                } else {
                    ""
                };
                format!("{}{}", repo_id, status)
            })
            .unwrap_or_else(|| "-".to_string());

        println!("  {}", name);
        println!("    local:  {}", local);
        println!("    remote: {}", remote);
    }
    Ok(())
}
