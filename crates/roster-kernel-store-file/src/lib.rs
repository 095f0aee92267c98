use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use roster_kernel_core::{Roster, RosterId, StudentRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info};

/// Bumped whenever the on-disk snapshot layout changes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no snapshot for roster {roster_id} at {}", path.display())]
    NotFound { roster_id: RosterId, path: PathBuf },
    #[error("snapshot at {} is corrupt: {reason}", path.display())]
    CorruptData { path: PathBuf, reason: String },
    #[error("i/o failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io { path: path.to_path_buf(), source }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::CorruptData { path: path.to_path_buf(), reason: reason.into() }
    }
}

/// What a completed save wrote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveReport {
    pub path: PathBuf,
    pub students: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    format_version: u32,
    roster_id: RosterId,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
    students_sha256: String,
    students: Vec<StudentRecord>,
}

/// Hex SHA-256 over the compact JSON encoding of `records`.
///
/// # Errors
/// Returns an error if a record cannot be serialized.
pub fn students_digest(records: &[StudentRecord]) -> Result<String, serde_json::Error> {
    let encoded = serde_json::to_vec(records)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// `<data_dir>/students_<roster_id>.json`
#[must_use]
pub fn default_snapshot_path(data_dir: &Path, roster_id: &RosterId) -> PathBuf {
    data_dir.join(format!("students_{roster_id}.json"))
}

/// One JSON snapshot per roster, replaced atomically on every save.
#[derive(Debug)]
pub struct FileRosterStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRosterStore {
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: data_dir.into(), write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn snapshot_path(&self, roster_id: &RosterId) -> PathBuf {
        default_snapshot_path(&self.data_dir, roster_id)
    }

    #[must_use]
    pub fn exists(&self, roster_id: &RosterId) -> bool {
        self.snapshot_path(roster_id).is_file()
    }

    /// Read and verify the snapshot for `roster_id`, rebuilding every index.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no snapshot exists,
    /// [`StoreError::CorruptData`] when it cannot be parsed, has an unknown
    /// format version, belongs to another roster, fails its checksum or holds
    /// conflicting records, and [`StoreError::Io`] for any other read failure.
    pub fn load(&self, roster_id: &RosterId) -> Result<Roster, StoreError> {
        let path = self.snapshot_path(roster_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { roster_id: roster_id.clone(), path });
            }
            Err(err) => return Err(StoreError::io(&path, err)),
        };

        let snapshot: SnapshotFile = serde_json::from_slice(&bytes)
            .map_err(|err| StoreError::corrupt(&path, format!("unreadable snapshot: {err}")))?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(StoreError::corrupt(
                &path,
                format!("unsupported format version {}", snapshot.format_version),
            ));
        }
        if snapshot.roster_id != *roster_id {
            return Err(StoreError::corrupt(
                &path,
                format!("snapshot belongs to roster {}", snapshot.roster_id),
            ));
        }
        let digest = students_digest(&snapshot.students)
            .map_err(|err| StoreError::corrupt(&path, err.to_string()))?;
        if digest != snapshot.students_sha256 {
            return Err(StoreError::corrupt(&path, "students checksum mismatch"));
        }

        let roster = Roster::from_records(snapshot.students)
            .map_err(|err| StoreError::corrupt(&path, err.to_string()))?;
        debug!(roster_id = %roster_id, students = roster.len(), path = %path.display(), "loaded roster snapshot");
        Ok(roster)
    }

    /// # Errors
    /// See [`FileRosterStore::save_records`].
    pub fn save(&self, roster_id: &RosterId, roster: &Roster) -> Result<SaveReport, StoreError> {
        self.save_records(roster_id, &roster.to_records())
    }

    /// Write a complete snapshot of `records`. The new file is written next to
    /// the old one, synced, then renamed over it; concurrent saves are serialized.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the data directory or snapshot cannot be
    /// written.
    pub fn save_records(
        &self,
        roster_id: &RosterId,
        records: &[StudentRecord],
    ) -> Result<SaveReport, StoreError> {
        let path = self.snapshot_path(roster_id);
        let students_sha256 =
            students_digest(records).map_err(|err| StoreError::io(&path, io::Error::other(err)))?;
        let snapshot = SnapshotFile {
            format_version: SNAPSHOT_FORMAT_VERSION,
            roster_id: roster_id.clone(),
            saved_at: OffsetDateTime::now_utc(),
            students_sha256,
            students: records.to_vec(),
        };
        let mut encoded = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| StoreError::io(&path, io::Error::other(err)))?;
        encoded.push(b'\n');

        let _guard = self.write_lock.lock();
        fs::create_dir_all(&self.data_dir).map_err(|err| StoreError::io(&self.data_dir, err))?;
        write_private_file(&path, &encoded)?;

        info!(roster_id = %roster_id, students = records.len(), path = %path.display(), "saved roster snapshot");
        Ok(SaveReport {
            path,
            students: records.len(),
            saved_at: snapshot.saved_at,
            sha256: snapshot.students_sha256,
        })
    }

    /// Move an unreadable snapshot aside so the next save does not destroy it.
    /// Returns the new location, or `None` when there was nothing to move.
    ///
    /// # Errors
    /// Returns [`StoreError::Io`] when the rename fails.
    pub fn quarantine(&self, roster_id: &RosterId) -> Result<Option<PathBuf>, StoreError> {
        let path = self.snapshot_path(roster_id);
        if !path.exists() {
            return Ok(None);
        }
        let mut target = path.clone().into_os_string();
        target.push(format!(".corrupt-{}", OffsetDateTime::now_utc().unix_timestamp_nanos()));
        let target = PathBuf::from(target);

        let _guard = self.write_lock.lock();
        fs::rename(&path, &target).map_err(|err| StoreError::io(&path, err))?;
        info!(roster_id = %roster_id, quarantined = %target.display(), "moved corrupt roster snapshot aside");
        Ok(Some(target))
    }
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(parent).map_err(|err| StoreError::io(parent, err))?;
    temp.write_all(contents).map_err(|err| StoreError::io(temp.path(), err))?;
    temp.as_file().sync_all().map_err(|err| StoreError::io(temp.path(), err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|err| StoreError::io(temp.path(), err))?;
    }

    temp.persist(path).map_err(|err| StoreError::io(path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use roster_kernel_core::{PlatformIdentity, StudentNumber};
    use ulid::Ulid;

    fn unique_store() -> (FileRosterStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("roster-store-{}", Ulid::new()));
        (FileRosterStore::new(&dir), dir)
    }

    fn roster_id() -> Result<RosterId> {
        RosterId::parse("guild-42").map_err(|err| anyhow!(err))
    }

    fn sample_roster() -> Result<Roster> {
        let mut roster = Roster::new();
        let ada = roster.add("Ada Lovelace", StudentNumber(1001), "ada@example.edu", false)?;
        roster.add("Grace Hopper", StudentNumber(1002), "grace@example.edu", false)?;
        roster.register(ada.secret.as_str(), PlatformIdentity { name: "ada_disc".to_string(), id: 42 })?;
        Ok(roster)
    }

    fn write_snapshot(path: &Path, snapshot: &SnapshotFile) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(snapshot)?)?;
        Ok(())
    }

    // Test IDs: TSTORE-001
    #[test]
    fn save_then_load_restores_records_and_indexes() -> Result<()> {
        let (store, dir) = unique_store();
        let id = roster_id()?;
        let roster = sample_roster()?;
        let ada_secret = roster.find_by_number(StudentNumber(1001))?.secret.clone();

        let report = store.save(&id, &roster)?;
        assert_eq!(report.students, 2);
        assert_eq!(report.path, dir.join("students_guild-42.json"));

        let loaded = store.load(&id)?;
        assert_eq!(
            serde_json::to_value(loaded.to_records())?,
            serde_json::to_value(roster.to_records())?
        );
        assert_eq!(loaded.find_by_identity(42)?.number, StudentNumber(1001));
        assert_eq!(loaded.find_by_secret(ada_secret.as_str())?.name, "Ada Lovelace");
        assert!(!loaded.find_by_number(StudentNumber(1002))?.is_registered());

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TSTORE-002
    #[test]
    fn missing_snapshot_is_not_found() -> Result<()> {
        let (store, _dir) = unique_store();
        match store.load(&roster_id()?) {
            Err(StoreError::NotFound { roster_id, .. }) => assert_eq!(roster_id.as_str(), "guild-42"),
            other => return Err(anyhow!("expected NotFound, got {other:?}")),
        }
        Ok(())
    }

    // Test IDs: TSTORE-003
    #[test]
    fn tampered_snapshot_fails_checksum() -> Result<()> {
        let (store, dir) = unique_store();
        let id = roster_id()?;
        store.save(&id, &sample_roster()?)?;

        let path = store.snapshot_path(&id);
        let tampered = fs::read_to_string(&path)?.replace("Grace Hopper", "Mallory");
        fs::write(&path, tampered)?;

        match store.load(&id) {
            Err(StoreError::CorruptData { reason, .. }) => assert!(reason.contains("checksum")),
            other => return Err(anyhow!("expected CorruptData, got {other:?}")),
        }
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TSTORE-004
    #[test]
    fn duplicate_numbers_are_corrupt_even_with_valid_checksum() -> Result<()> {
        let (store, dir) = unique_store();
        let id = roster_id()?;
        let students = vec![
            StudentRecord::new("Ada Lovelace", StudentNumber(7), "ada@example.edu"),
            StudentRecord::new("Ada Again", StudentNumber(7), "ada2@example.edu"),
        ];
        let snapshot = SnapshotFile {
            format_version: SNAPSHOT_FORMAT_VERSION,
            roster_id: id.clone(),
            saved_at: OffsetDateTime::now_utc(),
            students_sha256: students_digest(&students)?,
            students,
        };
        write_snapshot(&store.snapshot_path(&id), &snapshot)?;

        assert!(matches!(store.load(&id), Err(StoreError::CorruptData { .. })));
        fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TSTORE-005
    #[test]
    fn snapshot_for_another_roster_or_version_is_rejected() -> Result<()> {
        let (store, dir) = unique_store();
        let id = roster_id()?;
        let students = sample_roster()?.to_records();
        let mut snapshot = SnapshotFile {
            format_version: SNAPSHOT_FORMAT_VERSION,
            roster_id: RosterId::parse("guild-99").map_err(|err| anyhow!(err))?,
            saved_at: OffsetDateTime::now_utc(),
            students_sha256: students_digest(&students)?,
            students,
        };
        write_snapshot(&store.snapshot_path(&id), &snapshot)?;
        match store.load(&id) {
            Err(StoreError::CorruptData { reason, .. }) => assert!(reason.contains("guild-99")),
            other => return Err(anyhow!("expected CorruptData, got {other:?}")),
        }

        snapshot.roster_id = id.clone();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        write_snapshot(&store.snapshot_path(&id), &snapshot)?;
        match store.load(&id) {
            Err(StoreError::CorruptData { reason, .. }) => assert!(reason.contains("format version")),
            other => return Err(anyhow!("expected CorruptData, got {other:?}")),
        }

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TSTORE-006
    #[test]
    fn garbage_snapshot_is_corrupt_and_can_be_quarantined() -> Result<()> {
        let (store, dir) = unique_store();
        let id = roster_id()?;
        fs::create_dir_all(&dir)?;
        fs::write(store.snapshot_path(&id), b"\x80not json")?;

        assert!(matches!(store.load(&id), Err(StoreError::CorruptData { .. })));
        let moved = store.quarantine(&id)?.ok_or_else(|| anyhow!("snapshot should be moved"))?;
        assert!(moved.is_file());
        assert!(!store.exists(&id));
        assert!(matches!(store.load(&id), Err(StoreError::NotFound { .. })));
        assert_eq!(store.quarantine(&id)?, None);

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TSTORE-007
    #[test]
    fn repeated_saves_replace_the_snapshot_without_leftovers() -> Result<()> {
        let (store, dir) = unique_store();
        let id = roster_id()?;
        let mut roster = sample_roster()?;
        let first = store.save(&id, &roster)?;

        roster.remove(StudentNumber(1002))?;
        let second = store.save(&id, &roster)?;
        assert_ne!(first.sha256, second.sha256);
        assert_eq!(store.load(&id)?.len(), 1);

        let entries = fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
        assert_eq!(entries.len(), 1);

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TSTORE-008
    #[cfg(unix)]
    #[test]
    fn snapshot_is_private_to_the_owner() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let (store, dir) = unique_store();
        let id = roster_id()?;
        store.save(&id, &sample_roster()?)?;
        let mode = fs::metadata(store.snapshot_path(&id))?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TSTORE-009
    #[test]
    fn unreadable_snapshot_is_an_io_error_not_a_missing_one() -> Result<()> {
        let (store, dir) = unique_store();
        let id = roster_id()?;
        fs::create_dir_all(store.snapshot_path(&id))?;

        assert!(matches!(store.load(&id), Err(StoreError::Io { .. })));

        fs::remove_dir_all(dir)?;
        Ok(())
    }
}
