//! Private side-by-side isolation
//!
//! A dependency can be forced to bind privately by placing a manifest next
//! to the module that loads it. [`ManifestIsolation`] makes sure that
//! manifest is there, asking before it copies one in.

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::{Path, PathBuf};

/// Something that can put the process into its isolated configuration
pub trait Isolator {
    /// Returns whether the isolated configuration is in place
    fn ensure_isolated(&self) -> bool;
}

type Confirm = Box<dyn Fn(&Path) -> bool + Send + Sync>;

/// Ensures `<module_dir>/<manifest_name>` exists, copying it from `source`
pub struct ManifestIsolation {
    source: PathBuf,
    module_dir: PathBuf,
    manifest_name: String,
    confirm: Confirm,
}

impl ManifestIsolation {
    /// Copies without asking; use [`with_confirm`](Self::with_confirm) to prompt
    #[must_use]
    pub fn new(
        source: impl Into<PathBuf>,
        module_dir: impl Into<PathBuf>,
        manifest_name: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            module_dir: module_dir.into(),
            manifest_name: manifest_name.into(),
            confirm: Box::new(|_| true),
        }
    }

    /// Ask `confirm` (with the destination path) before copying
    #[must_use]
    pub fn with_confirm(
        mut self,
        confirm: impl Fn(&Path) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.confirm = Box::new(confirm);
        self
    }

    /// Where the manifest has to be
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.module_dir.join(&self.manifest_name)
    }

    fn install(&self, destination: &Path) -> Result<()> {
        std::fs::copy(&self.source, destination).with_context(|| {
            format!(
                "Failed to copy {} to {}\n\n\
                 The module directory may need elevated permissions.",
                self.source.display(),
                destination.display()
            )
        })?;
        Ok(())
    }
}

impl Isolator for ManifestIsolation {
    fn ensure_isolated(&self) -> bool {
        let destination = self.manifest_path();
        if destination.is_file() {
            return true;
        }

        if !(self.confirm)(&destination) {
            info!("Manifest installation declined: {}", destination.display());
            return false;
        }

        match self.install(&destination) {
            Ok(()) => {
                info!("Installed manifest {}", destination.display());
                true
            }
            Err(e) => {
                warn!("{e:#}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const MANIFEST: &str = "<assembly manifestVersion=\"1.0\"/>";

    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.manifest");
        std::fs::write(&source, MANIFEST).unwrap();
        let module_dir = dir.path().join("bin");
        std::fs::create_dir(&module_dir).unwrap();
        (dir, source, module_dir)
    }

    #[test]
    fn test_existing_manifest_needs_no_prompt() {
        let (_dir, source, module_dir) = fixture();
        std::fs::write(module_dir.join("host.exe.manifest"), MANIFEST).unwrap();

        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        let isolation = ManifestIsolation::new(source, &module_dir, "host.exe.manifest")
            .with_confirm(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            });

        assert!(isolation.ensure_isolated());
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_manifest_is_copied_after_confirmation() {
        let (_dir, source, module_dir) = fixture();
        let isolation = ManifestIsolation::new(source, &module_dir, "host.exe.manifest")
            .with_confirm(|path| path.ends_with("host.exe.manifest"));

        assert!(isolation.ensure_isolated());
        let copied = std::fs::read_to_string(module_dir.join("host.exe.manifest")).unwrap();
        assert_eq!(copied, MANIFEST);
    }

    #[test]
    fn test_declined_prompt_changes_nothing() {
        let (_dir, source, module_dir) = fixture();
        let isolation = ManifestIsolation::new(source, &module_dir, "host.exe.manifest")
            .with_confirm(|_| false);

        assert!(!isolation.ensure_isolated());
        assert!(!isolation.manifest_path().exists());
    }

    #[test]
    fn test_failed_copy_reports_false() {
        let (dir, _source, module_dir) = fixture();
        let source = dir.path().join("absent.manifest");
        let isolation = ManifestIsolation::new(source, &module_dir, "host.exe.manifest");
        assert!(!isolation.ensure_isolated());
    }
}
