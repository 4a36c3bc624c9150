use anyhow::Result;
use hugpy_core::{Settings, SourceDescriptor, download, locator};

pub fn run(name: &str, remote: bool) -> Result<()> {
    let settings = Settings::load();
    let source = locator::resolve(name, &settings.models, settings.prefer_local && !remote)?;

    match &source {
        SourceDescriptor::Local(path) => println!("local  {}", path.display()),
        SourceDescriptor::Remote(repo_id) => {
            println!("remote {}", repo_id);
            if let Some(dir) = download::cached_snapshot(&settings.cache_dir(), repo_id) {
                println!("cached {}", dir.display());
            }
        }
    }
    Ok(())
}
