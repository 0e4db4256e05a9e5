//! Per-beamline file-writer plugin hook, grounded on
//! `file_writer/file_writer_plugins/cSAXS.py`: the original evaluates a
//! beamline-specific Python module at load time to rewrite the master file
//! before it's finalized. Spec §9 ("Plugin pre-/post-startup scripts")
//! asks for a typed hook instead of source evaluation — this trait is
//! that hook (Part 3 item 5 of the expanded spec).

use super::writer::ScanStorage;

/// A beamline-specific rewrite of a scan's storage before the master file
/// is finalized. The default implementation is a no-op, matching what
/// beamlines without a plugin get.
pub trait FileFormatPlugin: Send + Sync {
    /// Mutate or augment `storage` in place before it's serialized.
    fn before_write(&self, _storage: &mut ScanStorage) {}

    /// Name surfaced in logs when this plugin runs.
    fn name(&self) -> &str {
        "default"
    }
}

/// The no-op plugin used when a beamline hasn't registered one.
#[derive(Debug, Default)]
pub struct NoopPlugin;

impl FileFormatPlugin for NoopPlugin {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_plugin_leaves_storage_untouched() {
        let mut storage = ScanStorage::new(uuid::Uuid::new_v4(), true);
        storage.metadata.insert("x".into(), serde_json::json!(1));
        let plugin = NoopPlugin;
        plugin.before_write(&mut storage);
        assert_eq!(storage.metadata.get("x"), Some(&serde_json::json!(1)));
    }
}
