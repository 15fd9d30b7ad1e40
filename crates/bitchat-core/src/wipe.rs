//! Emergency data wipe.
//!
//! Best-effort, ordered destruction of all durable state. Every step
//! runs even if earlier steps fail; failures are accumulated in the
//! report, never thrown. The wipe touches only the filesystem and the
//! keystore; it must never block on network or radio.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::storage::{Database, EncryptedDbKeystore, DB_SIBLING_SUFFIXES, DEFAULT_DB_NAME};

/// Outcome of a panic wipe.
#[derive(Debug)]
pub struct WipeReport {
    /// True iff no step recorded an error.
    pub success: bool,
    /// Labels of everything that was removed.
    pub deleted_items: Vec<String>,
    /// Non-fatal conditions, e.g. the database handle was still shared
    /// and its files were deleted underneath the open connection.
    pub warnings: Vec<String>,
    /// Accumulated step failures.
    pub errors: Vec<String>,
    /// Wall-clock duration of the wipe.
    pub duration_ms: u64,
}

/// The panic wipe. Holds the process-wide database singleton so it can
/// close the handle before deleting files; key shredding is allowed
/// even while other handles remain open, tolerating their subsequent
/// failures.
pub struct PanicWipe {
    data_dir: PathBuf,
    cache_dir: PathBuf,
    keystore: Arc<EncryptedDbKeystore>,
    db: Mutex<Option<Arc<Mutex<Database>>>>,
}

impl PanicWipe {
    /// Create a wipe rooted at the app's private directories.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
        keystore: Arc<EncryptedDbKeystore>,
        db: Option<Arc<Mutex<Database>>>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_dir: cache_dir.into(),
            keystore,
            db: Mutex::new(db),
        }
    }

    /// Run the wipe. Steps continue past failures; the report carries
    /// everything that was removed and every error encountered.
    pub async fn run(&self) -> WipeReport {
        let started = Instant::now();
        let mut deleted = Vec::new();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        info!("Panic wipe started");

        // 1. Close the database singleton. Other clones of the handle
        //    may survive; the wipe proceeds anyway and deletes the
        //    files underneath them, but only an actual close counts as
        //    a completed step.
        if let Some(db) = self.db.lock().await.take() {
            match Arc::try_unwrap(db) {
                Ok(mutex) => {
                    mutex.into_inner().close();
                    deleted.push("database handle".to_string());
                }
                Err(_) => {
                    warn!("Database handle still shared during wipe");
                    warnings.push(
                        "database handle still shared; files deleted under open handles"
                            .to_string(),
                    );
                }
            }
        }

        // 2. Database file and its sibling journal files.
        let db_path = self.data_dir.join(DEFAULT_DB_NAME);
        remove_file_step(&db_path, &mut deleted, &mut errors);
        for suffix in DB_SIBLING_SUFFIXES {
            let mut sibling = db_path.as_os_str().to_owned();
            sibling.push(suffix);
            remove_file_step(Path::new(&sibling), &mut deleted, &mut errors);
        }

        // 3. Preferences.
        remove_file_step(
            &crate::config::prefs_path(&self.data_dir),
            &mut deleted,
            &mut errors,
        );

        // 4. Cache directory, recursively.
        match std::fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => deleted.push(display(&self.cache_dir)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.push(format!("{}: {}", display(&self.cache_dir), e)),
        }

        // 5. Every remaining non-directory file under the data root.
        match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_file() {
                        remove_file_step(&path, &mut deleted, &mut errors);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.push(format!("{}: {}", display(&self.data_dir), e)),
        }

        // 6. Shred the database key last: even if file deletion failed,
        //    surviving ciphertext becomes unreadable.
        match self.keystore.shred().await {
            Ok(()) => deleted.push("database key".to_string()),
            Err(e) => errors.push(format!("key shred: {}", e)),
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let success = errors.is_empty();
        if success {
            info!(
                duration_ms,
                items = deleted.len(),
                warnings = warnings.len(),
                "Panic wipe complete"
            );
        } else {
            warn!(duration_ms, errors = errors.len(), "Panic wipe finished with errors");
        }

        WipeReport {
            success,
            deleted_items: deleted,
            warnings,
            errors,
            duration_ms,
        }
    }
}

fn remove_file_step(path: &Path, deleted: &mut Vec<String>, errors: &mut Vec<String>) {
    match std::fs::remove_file(path) {
        Ok(()) => deleted.push(display(path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => errors.push(format!("{}: {}", display(path), e)),
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
