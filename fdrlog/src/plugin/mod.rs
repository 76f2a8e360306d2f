//! # Plugin Loader
//!
//! Plugins create and register the concrete data sources. Static
//! plugins are handed over as trait objects; dynamic ones are shared
//! objects exporting a `fdrlog_plugin_entry` constructor, loaded from
//! a directory. One plugin failing to load or init never takes the
//! others down.


use std::path::Path;

use thiserror::Error;

use crate::recorder::LogManager;

/// Constructor symbol every dynamic plugin exports.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"fdrlog_plugin_entry";

pub type PluginEntryFn = unsafe fn() -> Box<dyn LogPlugin>;

#[derive(Debug, Error)]
pub enum PluginError {
  #[error("plugin init failed: {0}")]
  Init(String),
  #[error("plugin load failed: {0}")]
  Load(String),
}

/// One pluggable producer bundle. `init` registers its sources with
/// the manager; `shutdown` must remove them again.
pub trait LogPlugin: Send {
  fn name(&self) -> &str;

  fn init(&mut self, manager: &mut LogManager) -> Result<(), PluginError>;

  fn shutdown(&mut self, manager: &mut LogManager);

  /// Opaque settings blob; the grammar is plugin-defined and the call
  /// is idempotent.
  fn set_settings(&mut self, _blob: &str) {}
}

/// Supplies the per-plugin settings blob consumed at init time. The
/// concrete store is an external collaborator.
pub trait SettingsManager {
  fn plugin_settings(&self, plugin: &str) -> Option<String>;
}

/// Owns every loaded plugin and, for dynamic ones, the library handle
/// that must outlive it.
#[derive(Default)]
pub struct PluginLoader {
  plugins: Vec<Box<dyn LogPlugin>>,
  // kept alive for the lifetime of the plugins they produced
  libraries: Vec<libloading::Library>,
}

impl PluginLoader {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.plugins.len()
  }

  pub fn is_empty(&self) -> bool {
    self.plugins.is_empty()
  }

  /// Register a static plugin instance.
  pub fn register(&mut self, plugin: Box<dyn LogPlugin>) {
    self.plugins.push(plugin);
  }

  /// Register a whole set of static plugins.
  pub fn register_all(&mut self, plugins: Vec<Box<dyn LogPlugin>>) {
    self.plugins.extend(plugins);
  }

  /// Scan `dir` for shared objects and instantiate each one through
  /// its entry symbol. Per-file failures are logged and skipped.
  pub fn load_dir(&mut self, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
      Ok(entries) => entries,
      Err(err) => {
        tracing::warn!(dir = %dir.display(), %err, "cannot read plugin directory");
        return;
      },
    };
    for entry in entries.filter_map(|e| e.ok()) {
      let path = entry.path();
      if path.extension().map_or(true, |ext| ext != "so") {
        continue;
      }
      match self.load_library(&path) {
        Ok(()) => tracing::info!(path = %path.display(), "loaded plugin"),
        Err(err) => tracing::warn!(path = %path.display(), %err, "skipping plugin"),
      }
    }
  }

  fn load_library(&mut self, path: &Path) -> Result<(), PluginError> {
    // SAFETY: plugin libraries are trusted system components; the
    // entry symbol contract is part of the plugin ABI.
    unsafe {
      let library =
        libloading::Library::new(path).map_err(|e| PluginError::Load(e.to_string()))?;
      let entry: libloading::Symbol<'_, PluginEntryFn> = library
        .get(PLUGIN_ENTRY_SYMBOL)
        .map_err(|e| PluginError::Load(e.to_string()))?;
      let plugin = entry();
      self.plugins.push(plugin);
      self.libraries.push(library);
    }
    Ok(())
  }

  /// Feed settings and init every plugin against the manager. A
  /// failing plugin is logged and skipped.
  pub fn init_all(&mut self, manager: &mut LogManager, settings: Option<&dyn SettingsManager>) {
    for plugin in &mut self.plugins {
      if let Some(blob) = settings.and_then(|s| s.plugin_settings(plugin.name())) {
        plugin.set_settings(&blob);
      }
      if let Err(err) = plugin.init(manager) {
        tracing::warn!(plugin = plugin.name(), %err, "plugin init failed");
      }
    }
  }

  pub fn shutdown_all(&mut self, manager: &mut LogManager) {
    for plugin in &mut self.plugins {
      plugin.shutdown(manager);
    }
  }
}
