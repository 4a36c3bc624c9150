//! Process-wide table of model handles.
//!
//! At most one [`ModelHandle`] exists per logical name. The map lock is only
//! held while checking for and inserting a handle; constructing a handle
//! resolves its source and environment, which touches the filesystem but
//! never loads weights.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::backend::{LoadOptions, ModelLibrary};
use crate::download;
use crate::environment::{EnvironmentOverrides, EnvironmentProbe};
use crate::error::Result;
use crate::handle::ModelHandle;
use crate::locator::{self, SourceDescriptor};
use crate::settings::{ModelEntry, Settings};

pub struct HandleRegistry {
    library: Arc<dyn ModelLibrary>,
    probe: EnvironmentProbe,
    prefer_local: bool,
    use_quantization: bool,
    cache_dir: Option<std::path::PathBuf>,
    handles: Mutex<HashMap<String, Arc<ModelHandle>>>,
    created: AtomicUsize,
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("library", &self.library.name())
            .field("handles", &self.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandleRegistry {
    pub fn new(library: Arc<dyn ModelLibrary>) -> Self {
        Self {
            library,
            probe: EnvironmentProbe::default(),
            prefer_local: true,
            use_quantization: false,
            cache_dir: None,
            handles: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Registry honoring the process-wide knobs of `settings`
    pub fn from_settings(library: Arc<dyn ModelLibrary>, settings: &Settings) -> Self {
        Self {
            probe: EnvironmentProbe::new(EnvironmentOverrides {
                device: settings.device,
                precision: settings.precision,
            }),
            prefer_local: settings.prefer_local,
            use_quantization: settings.use_quantization,
            cache_dir: Some(settings.cache_dir()),
            ..Self::new(library)
        }
    }

    pub fn library(&self) -> &Arc<dyn ModelLibrary> {
        &self.library
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ModelHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle for `name`, constructing it on first use.
    ///
    /// Fails with a configuration error when the entry has no usable source;
    /// nothing is inserted in that case.
    pub fn get_or_create(&self, name: &str, entry: Option<&ModelEntry>) -> Result<Arc<ModelHandle>> {
        let mut handles = self.lock();
        if let Some(handle) = handles.get(name) {
            return Ok(handle.clone());
        }

        let entry = entry.ok_or_else(|| {
            crate::error::HandleError::configuration(name, "no such model in configuration")
        })?;
        let handle = Arc::new(self.construct(name, entry)?);
        handles.insert(name.to_string(), handle.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn construct(&self, name: &str, entry: &ModelEntry) -> Result<ModelHandle> {
        let source = self.resolve(name, entry)?;
        let library = self.library.as_ref();
        let environment = self.probe.get(library).with_overrides(
            library,
            &EnvironmentOverrides {
                device: entry.device,
                precision: entry.precision,
            },
        );

        let quantize = self.use_quantization
            && environment.device.is_accelerator()
            && self.probe.quantization_available(library);

        crate::verbose!(
            "Created handle '{}' ({} on {}, {})",
            name,
            source,
            environment.device,
            environment.precision
        );

        Ok(
            ModelHandle::new(name, source, environment, self.library.clone())
                .with_defaults(entry.generation.clone())
                .with_load_options(LoadOptions {
                    quantize,
                    cache_dir: self.cache_dir.clone(),
                }),
        )
    }

    /// Resolve an entry, preferring a downloaded snapshot over the remote id
    fn resolve(&self, name: &str, entry: &ModelEntry) -> Result<SourceDescriptor> {
        let source = locator::resolve_entry(name, entry, self.prefer_local)?;
        if let (SourceDescriptor::Remote(repo_id), Some(cache_dir)) = (&source, &self.cache_dir)
            && let Some(dir) = download::cached_snapshot(cache_dir, repo_id)
        {
            crate::verbose!("Using downloaded snapshot of {} at {}", repo_id, dir.display());
            return Ok(SourceDescriptor::Local(dir));
        }
        Ok(source)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModelHandle>> {
        self.lock().get(name).cloned()
    }

    /// Names whose handles can serve requests
    pub fn list_loaded(&self) -> BTreeSet<String> {
        self.lock()
            .iter()
            .filter(|(_, handle)| handle.is_ready())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Unload one handle; unknown names are ignored
    pub fn unload(&self, name: &str) {
        // Clone out first so a long unload does not block the map
        let handle = self.get(name);
        if let Some(handle) = handle {
            handle.unload();
        }
    }

    pub fn unload_all(&self) {
        let handles: Vec<_> = self.lock().values().cloned().collect();
        for handle in handles {
            handle.unload();
        }
    }

    /// Load a handle on a background thread.
    ///
    /// Construction errors are returned; load failures are only logged.
    pub fn preload(&self, name: &str, entry: Option<&ModelEntry>) -> Result<JoinHandle<()>> {
        let handle = self.get_or_create(name, entry)?;
        Ok(thread::spawn(move || {
            if let Err(e) = handle.load() {
                crate::warning!("Failed to preload '{}': {}", handle.name(), e);
            }
        }))
    }

    /// Number of handles constructed so far
    pub fn handles_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}
