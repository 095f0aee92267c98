use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use roster_kernel_core::{
    attendance_summary, summarize_poll, word_participation, write_export_csv, ChannelMessage,
    ExportRow, ImportSummary, ParticipationLine, PlatformIdentity, PollOption, PollReaction,
    PollSummary, RegistrationState, Roster, RosterId, StudentNumber, StudentRecord,
};
use roster_kernel_store_file::{FileRosterStore, SaveReport, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

mod autosave;

pub use autosave::{Autosave, DEFAULT_AUTOSAVE_INTERVAL};

pub const API_CONTRACT_VERSION: &str = "roster.api.v1";

/// A student as shown to instructors and command surfaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudentView {
    pub name: String,
    pub number: StudentNumber,
    pub email: String,
    pub secret: String,
    pub platform_identity: Option<PlatformIdentity>,
    pub is_registered: bool,
    pub state: RegistrationState,
}

impl From<&StudentRecord> for StudentView {
    fn from(record: &StudentRecord) -> Self {
        Self {
            name: record.name.clone(),
            number: record.number,
            email: record.email.clone(),
            secret: record.secret.as_str().to_string(),
            platform_identity: record.platform_identity.clone(),
            is_registered: record.is_registered(),
            state: record.state(),
        }
    }
}

impl From<StudentRecord> for StudentView {
    fn from(record: StudentRecord) -> Self {
        Self::from(&record)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateStudentRequest {
    pub name: String,
    pub number: StudentNumber,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterRequest {
    pub secret: String,
    pub platform_identity: PlatformIdentity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportOptions {
    #[serde(default)]
    pub has_header: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollRequest {
    /// Falls back to the thumbs-up/thumbs-down pair when empty.
    #[serde(default)]
    pub options: Vec<PollOption>,
    pub reactions: Vec<PollReaction>,
    #[serde(default)]
    pub bot_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttendanceRequest {
    pub responders: Vec<PlatformIdentity>,
    #[serde(default)]
    pub bot_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterStatus {
    pub roster_id: RosterId,
    pub students: usize,
    pub registered: usize,
    pub snapshot_path: String,
    pub snapshot_exists: bool,
}

/// Shared handle to the one roster a deployment owns. Clones share state.
///
/// Every mutation runs under a synchronous lock that is never held across an
/// `.await`. A save holds the save lock from copying the records out until the
/// snapshot is on disk, so concurrent saves land in the order they copied.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    roster_id: RosterId,
    store: FileRosterStore,
    roster: Mutex<Roster>,
    save_lock: Mutex<()>,
}

impl Registry {
    /// Load the roster snapshot, or start empty when it is missing or corrupt.
    /// A corrupt snapshot is moved aside so the next save cannot overwrite it.
    ///
    /// # Errors
    /// Returns an error when the snapshot exists but cannot be read, leaving it
    /// untouched on disk.
    pub fn create_or_load(store: FileRosterStore, roster_id: RosterId) -> Result<Self> {
        let roster = match store.load(&roster_id) {
            Ok(roster) => {
                info!(roster_id = %roster_id, students = roster.len(), "loaded roster");
                roster
            }
            Err(StoreError::NotFound { path, .. }) => {
                warn!(roster_id = %roster_id, path = %path.display(), "no roster snapshot found; starting with an empty roster");
                Roster::new()
            }
            Err(StoreError::CorruptData { path, reason }) => {
                warn!(roster_id = %roster_id, path = %path.display(), %reason, "roster snapshot is corrupt; starting with an empty roster");
                match store.quarantine(&roster_id) {
                    Ok(Some(moved)) => warn!(moved = %moved.display(), "kept corrupt snapshot for inspection"),
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "failed to move corrupt snapshot aside"),
                }
                Roster::new()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read roster {roster_id}"));
            }
        };
        Ok(Self::from_roster(store, roster_id, roster))
    }

    #[must_use]
    pub fn from_roster(store: FileRosterStore, roster_id: RosterId, roster: Roster) -> Self {
        Self {
            inner: Arc::new(Inner {
                roster_id,
                store,
                roster: Mutex::new(roster),
                save_lock: Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn roster_id(&self) -> &RosterId {
        &self.inner.roster_id
    }

    fn read<T>(&self, f: impl FnOnce(&Roster) -> T) -> T {
        let roster = self.inner.roster.lock();
        f(&roster)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Roster) -> T) -> T {
        let mut roster = self.inner.roster.lock();
        f(&mut roster)
    }

    /// # Errors
    /// Returns a [`roster_kernel_core::RegistryError`] on duplicates or invalid input.
    pub fn create(&self, input: CreateStudentRequest) -> Result<StudentView> {
        let record = self.write(|roster| {
            roster.add(&input.name, input.number, &input.email, input.overwrite)
        })?;
        info!(number = %record.number, overwrite = input.overwrite, "created student");
        Ok(record.into())
    }

    /// # Errors
    /// Returns [`roster_kernel_core::RegistryError::NotFound`] for unknown numbers.
    pub fn remove(&self, number: StudentNumber) -> Result<StudentView> {
        let record = self.write(|roster| roster.remove(number))?;
        info!(number = %number, "removed student");
        Ok(record.into())
    }

    /// # Errors
    /// Returns [`roster_kernel_core::RegistryError::NotFound`] for unknown numbers.
    pub fn reset(&self, number: StudentNumber) -> Result<StudentView> {
        let record = self.write(|roster| roster.reset(number))?;
        info!(number = %number, "reset student registration");
        Ok(record.into())
    }

    /// # Errors
    /// Returns [`roster_kernel_core::RegistryError::NotFound`] for unknown numbers.
    pub fn regenerate_secret(&self, number: StudentNumber) -> Result<StudentView> {
        let record = self.write(|roster| roster.regenerate_secret(number))?;
        info!(number = %number, "issued a new secret");
        Ok(record.into())
    }

    /// # Errors
    /// Returns the registration failure from [`Roster::register`].
    pub fn register(&self, secret: &str, identity: PlatformIdentity) -> Result<StudentView> {
        let identity_id = identity.id;
        let record = match self.write(|roster| roster.register(secret, identity)) {
            Ok(record) => record,
            Err(err) => {
                warn!(identity_id, error = %err, "registration rejected");
                return Err(err.into());
            }
        };
        info!(number = %record.number, identity_id, "registered student");
        Ok(record.into())
    }

    /// # Errors
    /// Returns [`roster_kernel_core::RegistryError::NotFound`] when the identity
    /// is not bound to a student.
    pub fn lookup_by_identity(&self, identity_id: u64) -> Result<StudentView> {
        Ok(self.read(|roster| roster.find_by_identity(identity_id).map(StudentView::from))?)
    }

    /// # Errors
    /// Returns [`roster_kernel_core::RegistryError::NotFound`] for unknown numbers.
    pub fn lookup_by_number(&self, number: StudentNumber) -> Result<StudentView> {
        Ok(self.read(|roster| roster.find_by_number(number).map(StudentView::from))?)
    }

    #[must_use]
    pub fn list(&self) -> Vec<StudentView> {
        self.read(|roster| roster.iter().map(StudentView::from).collect())
    }

    #[must_use]
    pub fn status(&self) -> RosterStatus {
        let (students, registered) = self.read(|roster| (roster.len(), roster.registered_count()));
        let path = self.inner.store.snapshot_path(&self.inner.roster_id);
        RosterStatus {
            roster_id: self.inner.roster_id.clone(),
            students,
            registered,
            snapshot_path: path.display().to_string(),
            snapshot_exists: path.is_file(),
        }
    }

    /// The full roster as CSV, one row per student ordered by number.
    ///
    /// # Errors
    /// Returns an error when the CSV cannot be encoded.
    pub fn export_csv(&self) -> Result<String> {
        let rows = self.read(Roster::export_rows);
        render_csv(&rows)
    }

    /// The record file handed to an instructor for a single student.
    ///
    /// # Errors
    /// Returns [`roster_kernel_core::RegistryError::NotFound`] for unknown
    /// numbers, or an error when the CSV cannot be encoded.
    pub fn export_student_csv(&self, number: StudentNumber) -> Result<String> {
        let rows = self.read(|roster| roster.export_student_rows(number))?;
        render_csv(&rows)
    }

    /// Add every row of a CSV upload. Row failures are tallied, never raised.
    #[must_use]
    pub fn import_csv(&self, input: &[u8], options: ImportOptions) -> ImportSummary {
        let summary =
            self.write(|roster| roster.import_csv(input, options.has_header, options.overwrite));
        info!(
            success_count = summary.success_count,
            failure_count = summary.failure_count,
            "imported roster rows"
        );
        summary
    }

    #[must_use]
    pub fn word_participation(&self, messages: &[ChannelMessage]) -> Vec<ParticipationLine> {
        self.read(|roster| word_participation(roster, messages))
    }

    #[must_use]
    pub fn summarize_poll(&self, input: &PollRequest) -> PollSummary {
        let default_options;
        let options = if input.options.is_empty() {
            default_options = PollOption::yes_no();
            &default_options
        } else {
            &input.options
        };
        self.read(|roster| summarize_poll(roster, options, &input.reactions, input.bot_id))
    }

    #[must_use]
    pub fn attendance(&self, input: &AttendanceRequest) -> Vec<String> {
        self.read(|roster| attendance_summary(roster, &input.responders, input.bot_id))
    }

    /// Persist a complete snapshot of the roster.
    ///
    /// # Errors
    /// Returns an error when the snapshot cannot be written.
    pub fn save(&self) -> Result<SaveReport> {
        let _saving = self.inner.save_lock.lock();
        let records = self.read(Roster::to_records);
        self.inner
            .store
            .save_records(&self.inner.roster_id, &records)
            .with_context(|| format!("failed to save roster {}", self.inner.roster_id))
    }

    /// [`Registry::save`] on the blocking pool.
    ///
    /// # Errors
    /// Returns an error when the save fails or the blocking task is cancelled.
    pub async fn flush(&self) -> Result<SaveReport> {
        let registry = self.clone();
        tokio::task::spawn_blocking(move || registry.save())
            .await
            .context("roster save task did not complete")?
    }
}

fn render_csv(rows: &[ExportRow]) -> Result<String> {
    let mut buffer = Vec::new();
    write_export_csv(rows, &mut buffer).context("failed to encode roster CSV")?;
    String::from_utf8(buffer).context("roster CSV is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use roster_kernel_core::RegistryError;

    fn unique_data_dir() -> PathBuf {
        std::env::temp_dir().join(format!("roster-api-{}", ulid::Ulid::new()))
    }

    fn roster_id() -> Result<RosterId> {
        Ok(RosterId::parse("guild-42")?)
    }

    fn registry_at(dir: &PathBuf) -> Result<Registry> {
        Registry::create_or_load(FileRosterStore::new(dir), roster_id()?)
    }

    fn ada() -> CreateStudentRequest {
        CreateStudentRequest {
            name: "Ada Lovelace".to_string(),
            number: StudentNumber(1001),
            email: "ada@example.edu".to_string(),
            overwrite: false,
        }
    }

    fn registry_error(err: &anyhow::Error) -> Option<&RegistryError> {
        err.downcast_ref::<RegistryError>()
    }

    // Test IDs: TAPI-001
    #[test]
    fn ada_registers_resets_and_registers_again() -> Result<()> {
        let dir = unique_data_dir();
        let registry = registry_at(&dir)?;

        let created = registry.create(ada())?;
        assert_eq!(created.state, RegistrationState::Unregistered);
        let exported = registry.export_csv()?;
        assert!(exported.contains(&created.secret));

        let discord = PlatformIdentity { name: "ada_disc".to_string(), id: 42 };
        let registered = registry.register(&created.secret, discord.clone())?;
        assert!(registered.is_registered);
        assert_eq!(registry.lookup_by_identity(42)?.number, StudentNumber(1001));

        let again =
            registry.register(&created.secret, PlatformIdentity { name: "other".to_string(), id: 43 });
        match again {
            Err(err) => assert_eq!(
                registry_error(&err),
                Some(&RegistryError::AlreadyRegistered(StudentNumber(1001)))
            ),
            Ok(view) => panic!("second registration should fail, got {view:?}"),
        }

        registry.reset(StudentNumber(1001))?;
        assert!(registry.lookup_by_identity(42).is_err());
        let re_registered = registry.register(&created.secret, discord)?;
        assert_eq!(re_registered.state, RegistrationState::Registered);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn saved_roster_is_loaded_on_next_start() -> Result<()> {
        let dir = unique_data_dir();
        let registry = registry_at(&dir)?;
        let created = registry.create(ada())?;
        registry.register(&created.secret, PlatformIdentity { name: "ada_disc".to_string(), id: 42 })?;
        let report = registry.save()?;
        assert_eq!(report.students, 1);

        let reloaded = registry_at(&dir)?;
        let view = reloaded.lookup_by_identity(42)?;
        assert_eq!(view.secret, created.secret);
        assert_eq!(reloaded.status().registered, 1);

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn corrupt_snapshot_starts_empty_and_is_kept_aside() -> Result<()> {
        let dir = unique_data_dir();
        std::fs::create_dir_all(&dir)?;
        let store = FileRosterStore::new(&dir);
        std::fs::write(store.snapshot_path(&roster_id()?), b"{ not json")?;

        let registry = registry_at(&dir)?;
        assert!(registry.list().is_empty());
        assert!(!registry.status().snapshot_exists);
        let leftovers = std::fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
        assert_eq!(leftovers.len(), 1);
        assert!(leftovers[0].file_name().to_string_lossy().contains(".corrupt-"));

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn import_reports_counts_and_student_export_has_one_row() -> Result<()> {
        let registry = registry_at(&unique_data_dir())?;
        let csv = "first_name,last_name,email,number\n\
                   Ada,Lovelace,ada@example.edu,1001\n\
                   Alan,Turing,alan@example.edu\n\
                   Grace,Hopper,grace@example.edu,abc\n\
                   Ada,Again,ada2@example.edu,1001\n";
        let summary = registry.import_csv(
            csv.as_bytes(),
            ImportOptions { has_header: true, overwrite: false },
        );
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.failure_count, 3);

        let single = registry.export_student_csv(StudentNumber(1001))?;
        assert_eq!(single.lines().count(), 2);
        assert!(single.lines().nth(1).is_some_and(|line| line.starts_with("Ada Lovelace,1001,")));
        assert!(registry.export_student_csv(StudentNumber(9)).is_err());
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn rotated_secret_replaces_the_old_one() -> Result<()> {
        let registry = registry_at(&unique_data_dir())?;
        let created = registry.create(ada())?;
        let rotated = registry.regenerate_secret(StudentNumber(1001))?;
        assert_ne!(rotated.secret, created.secret);

        let stale = registry.register(&created.secret, PlatformIdentity { name: "x".to_string(), id: 1 });
        match stale {
            Err(err) => assert_eq!(registry_error(&err), Some(&RegistryError::InvalidSecret)),
            Ok(view) => panic!("stale secret should be rejected, got {view:?}"),
        }
        registry.register(&rotated.secret, PlatformIdentity { name: "x".to_string(), id: 1 })?;
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn poll_defaults_to_yes_no_options() -> Result<()> {
        let registry = registry_at(&unique_data_dir())?;
        let created = registry.create(ada())?;
        let voter = PlatformIdentity { name: "ada_disc".to_string(), id: 42 };
        registry.register(&created.secret, voter.clone())?;

        let summary = registry.summarize_poll(&PollRequest {
            options: Vec::new(),
            reactions: vec![PollReaction { emoji: "👍".to_string(), voters: vec![voter.clone()] }],
            bot_id: None,
        });
        assert_eq!(summary.winner.map(|tally| tally.label), Some("Yes".to_string()));
        assert_eq!(summary.participation, vec!["Ada Lovelace: Yes".to_string()]);

        let present = registry.attendance(&AttendanceRequest { responders: vec![voter], bot_id: None });
        assert_eq!(present, vec!["Ada Lovelace#1001".to_string()]);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn racing_saves_leave_the_newest_snapshot_on_disk() -> Result<()> {
        let dir = unique_data_dir();
        let registry = registry_at(&dir)?;
        let store = FileRosterStore::new(&dir);

        for round in 0..200_u32 {
            let (background, foreground) = std::thread::scope(|scope| {
                let background = scope.spawn(|| registry.save());
                let foreground = scope.spawn(|| -> Result<SaveReport> {
                    registry.create(CreateStudentRequest {
                        name: format!("Student {round}"),
                        number: StudentNumber(u64::from(round) + 1),
                        email: String::new(),
                        overwrite: false,
                    })?;
                    registry.save()
                });
                (background.join(), foreground.join())
            });
            let background = match background {
                Ok(report) => report?,
                Err(_) => panic!("background save thread panicked"),
            };
            let foreground = match foreground {
                Ok(report) => report?,
                Err(_) => panic!("create-and-save thread panicked"),
            };

            let on_disk = store.load(&roster_id()?)?;
            let newest = background.students.max(foreground.students);
            assert_eq!(on_disk.len(), newest, "round {round} left a stale snapshot");
            assert_eq!(on_disk.len(), registry.status().students);
        }

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn one_secret_registers_exactly_once_under_contention() -> Result<()> {
        let registry = registry_at(&unique_data_dir())?;
        let created = registry.create(ada())?;

        let outcomes = std::thread::scope(|scope| {
            let handles = (0..8_u64)
                .map(|i| {
                    let registry = &registry;
                    let secret = created.secret.as_str();
                    scope.spawn(move || {
                        registry.register(
                            secret,
                            PlatformIdentity { name: format!("user{i}"), id: 100 + i },
                        )
                    })
                })
                .collect::<Vec<_>>();
            handles.into_iter().map(std::thread::ScopedJoinHandle::join).collect::<Vec<_>>()
        });

        let mut winners = Vec::new();
        let mut already_registered = 0;
        for outcome in outcomes {
            match outcome {
                Ok(Ok(view)) => winners.push(view),
                Ok(Err(err)) => {
                    assert_eq!(
                        registry_error(&err),
                        Some(&RegistryError::AlreadyRegistered(StudentNumber(1001)))
                    );
                    already_registered += 1;
                }
                Err(_) => panic!("register thread panicked"),
            }
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(already_registered, 7);
        assert_eq!(registry.status().registered, 1);

        let winner = match winners[0].platform_identity.clone() {
            Some(identity) => identity,
            None => panic!("winning registration has no identity"),
        };
        assert_eq!(registry.lookup_by_identity(winner.id)?.number, StudentNumber(1001));
        Ok(())
    }

    // Test IDs: TAPI-009
    #[test]
    fn unreadable_snapshot_fails_startup_and_stays_in_place() -> Result<()> {
        let dir = unique_data_dir();
        let store = FileRosterStore::new(&dir);
        let snapshot = store.snapshot_path(&roster_id()?);
        std::fs::create_dir_all(&snapshot)?;

        match Registry::create_or_load(store, roster_id()?) {
            Err(err) => assert!(matches!(
                err.downcast_ref::<StoreError>(),
                Some(StoreError::Io { .. })
            )),
            Ok(registry) => panic!("unreadable snapshot should fail, got {registry:?}"),
        }
        assert!(snapshot.is_dir());

        std::fs::remove_dir_all(dir)?;
        Ok(())
    }
}
