use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use rand::RngCore;
use serde::{Deserialize, Serialize};

mod bulk;
mod participation;

pub use bulk::{
    write_export_csv, ExportRow, ImportFailure, ImportRow, ImportSummary, EXPORT_HEADER,
    IMPORT_COLUMNS,
};
pub use participation::{
    attendance_summary, summarize_poll, word_participation, ChannelMessage, ParticipationLine,
    PollOption, PollReaction, PollSummary, PollTally,
};

/// Secrets carry 256 bits of entropy.
pub const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RegistryError {
    #[error("no student found for {0}")]
    NotFound(LookupKey),
    #[error("refusing to replace existing student {0}; set overwrite to replace it")]
    Duplicate(StudentNumber),
    #[error("incorrect secret")]
    InvalidSecret,
    #[error("student {0} is already registered")]
    AlreadyRegistered(StudentNumber),
    #[error("platform identity {identity_id} is already registered to student {number}")]
    IdentityInUse { identity_id: u64, number: StudentNumber },
    #[error("validation error: {0}")]
    Validation(String),
}

/// The key a failed lookup was performed with. Secrets are never echoed back.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LookupKey {
    Number(StudentNumber),
    Secret,
    Identity(u64),
}

impl Display for LookupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(number) => write!(f, "student number {number}"),
            Self::Secret => write!(f, "the given secret"),
            Self::Identity(id) => write!(f, "platform identity {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct StudentNumber(pub u64);

impl Display for StudentNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StudentNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Identifies the one roster a deployment owns, e.g. a server id.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RosterId(String);

impl RosterId {
    /// Parse a roster id. Only ASCII alphanumerics, `-` and `_` are accepted so the
    /// id can be embedded in a file name.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] for empty ids or ids with other characters.
    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::Validation("roster id MUST be non-empty".to_string()));
        }
        if !trimmed.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_') {
            return Err(RegistryError::Validation(format!(
                "roster id MUST only contain [A-Za-z0-9_-]: {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RosterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RosterId {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RosterId> for String {
    fn from(value: RosterId) -> Self {
        value.0
    }
}

/// A single-use registration credential: 64 lowercase hex characters.
#[derive(Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0_u8; SECRET_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Parse a secret supplied by a student. Surrounding whitespace is ignored and
    /// hex digits are case-insensitive.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when the value is not 64 hex characters.
    pub fn parse(value: &str) -> Result<Self, RegistryError> {
        let trimmed = value.trim();
        if trimmed.len() != SECRET_BYTES * 2 || !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RegistryError::Validation(format!(
                "secret MUST be {} hex characters",
                SECRET_BYTES * 2
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl TryFrom<String> for Secret {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Secret> for String {
    fn from(value: Secret) -> Self {
        value.0
    }
}

/// An account on the chat platform, as reported by the platform client.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct PlatformIdentity {
    pub name: String,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

impl RegistrationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unregistered => "unregistered",
            Self::Registered => "registered",
        }
    }
}

/// One student on the roster. Equality and hashing only consider `number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentRecord {
    pub name: String,
    pub number: StudentNumber,
    pub email: String,
    pub secret: Secret,
    #[serde(default)]
    pub platform_identity: Option<PlatformIdentity>,
}

impl StudentRecord {
    /// Build an unregistered record with a freshly generated secret.
    #[must_use]
    pub fn new(name: impl Into<String>, number: StudentNumber, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            number,
            email: email.into(),
            secret: Secret::generate(),
            platform_identity: None,
        }
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.platform_identity.is_some()
    }

    #[must_use]
    pub fn state(&self) -> RegistrationState {
        if self.is_registered() {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        }
    }

    /// Check the fields a roster relies on.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when `name` is blank.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Validation(format!(
                "name MUST be provided for student {}",
                self.number
            )));
        }
        Ok(())
    }
}

impl PartialEq for StudentRecord {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl Eq for StudentRecord {}

impl Hash for StudentRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.number.hash(state);
    }
}

impl Display for StudentRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Student(name={}, number={})", self.name, self.number)
    }
}

/// The canonical record set of one roster plus its two derived lookup indexes.
///
/// Every mutation goes through `&mut self` and updates the canonical map and both
/// indexes before returning, so no caller can observe a half-applied change.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    students: BTreeMap<StudentNumber, StudentRecord>,
    by_secret: HashMap<Secret, StudentNumber>,
    by_identity: HashMap<u64, StudentNumber>,
}

impl Roster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a roster and its indexes from a persisted record set.
    ///
    /// # Errors
    /// Returns an error when a record is invalid or when numbers, secrets, or
    /// platform identity ids collide.
    pub fn from_records(
        records: impl IntoIterator<Item = StudentRecord>,
    ) -> Result<Self, RegistryError> {
        let mut roster = Self::new();
        for record in records {
            record.validate()?;
            if roster.students.contains_key(&record.number) {
                return Err(RegistryError::Duplicate(record.number));
            }
            if let Some(existing) = roster.by_secret.get(&record.secret) {
                return Err(RegistryError::Validation(format!(
                    "students {existing} and {} share a secret",
                    record.number
                )));
            }
            if let Some(identity) = &record.platform_identity {
                if let Some(existing) = roster.by_identity.get(&identity.id) {
                    return Err(RegistryError::IdentityInUse {
                        identity_id: identity.id,
                        number: *existing,
                    });
                }
            }
            roster.attach(record);
        }
        Ok(roster)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.students.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.by_identity.len()
    }

    /// Records ordered by student number.
    pub fn iter(&self) -> impl Iterator<Item = &StudentRecord> {
        self.students.values()
    }

    #[must_use]
    pub fn to_records(&self) -> Vec<StudentRecord> {
        self.students.values().cloned().collect()
    }

    /// Add a new unregistered student with a fresh secret.
    ///
    /// With `overwrite`, an existing record with the same number is replaced and
    /// its secret and registration are discarded.
    ///
    /// # Errors
    /// Returns [`RegistryError::Duplicate`] when the number exists and `overwrite`
    /// is false, or [`RegistryError::Validation`] for a blank name.
    pub fn add(
        &mut self,
        name: &str,
        number: StudentNumber,
        email: &str,
        overwrite: bool,
    ) -> Result<StudentRecord, RegistryError> {
        let mut record = StudentRecord::new(name, number, email);
        record.validate()?;

        if self.students.contains_key(&number) {
            if !overwrite {
                return Err(RegistryError::Duplicate(number));
            }
            self.detach(number);
        }

        while self.by_secret.contains_key(&record.secret) {
            record.secret = Secret::generate();
        }

        self.attach(record.clone());
        Ok(record)
    }

    /// Remove a student from the canonical set and from both indexes.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] when no student has `number`.
    pub fn remove(&mut self, number: StudentNumber) -> Result<StudentRecord, RegistryError> {
        self.detach(number).ok_or(RegistryError::NotFound(LookupKey::Number(number)))
    }

    /// Clear a student's registration. The secret is kept, so the student can
    /// register again with the credential they already hold.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] when no student has `number`.
    pub fn reset(&mut self, number: StudentNumber) -> Result<StudentRecord, RegistryError> {
        let record = self
            .students
            .get_mut(&number)
            .ok_or(RegistryError::NotFound(LookupKey::Number(number)))?;
        if let Some(identity) = record.platform_identity.take() {
            self.by_identity.remove(&identity.id);
        }
        Ok(record.clone())
    }

    /// Issue a fresh secret. The old secret stops resolving immediately;
    /// registration state is left as is.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotFound`] when no student has `number`.
    pub fn regenerate_secret(
        &mut self,
        number: StudentNumber,
    ) -> Result<StudentRecord, RegistryError> {
        if !self.students.contains_key(&number) {
            return Err(RegistryError::NotFound(LookupKey::Number(number)));
        }
        let mut secret = Secret::generate();
        while self.by_secret.contains_key(&secret) {
            secret = Secret::generate();
        }

        let Some(record) = self.students.get_mut(&number) else {
            return Err(RegistryError::NotFound(LookupKey::Number(number)));
        };
        let old = std::mem::replace(&mut record.secret, secret.clone());
        self.by_secret.remove(&old);
        self.by_secret.insert(secret, number);
        Ok(record.clone())
    }

    /// Claim the record holding `secret` for `identity`.
    ///
    /// # Errors
    /// Returns [`RegistryError::InvalidSecret`] when the secret is malformed or
    /// unknown, [`RegistryError::AlreadyRegistered`] when the record was already
    /// claimed, and [`RegistryError::IdentityInUse`] when `identity` is bound to
    /// another student.
    pub fn register(
        &mut self,
        secret: &str,
        identity: PlatformIdentity,
    ) -> Result<StudentRecord, RegistryError> {
        let secret = Secret::parse(secret).map_err(|_| RegistryError::InvalidSecret)?;
        let number = *self.by_secret.get(&secret).ok_or(RegistryError::InvalidSecret)?;

        let registered = self
            .students
            .get(&number)
            .ok_or(RegistryError::NotFound(LookupKey::Number(number)))?
            .is_registered();
        if registered {
            return Err(RegistryError::AlreadyRegistered(number));
        }
        if let Some(bound) = self.by_identity.get(&identity.id) {
            return Err(RegistryError::IdentityInUse { identity_id: identity.id, number: *bound });
        }

        let record = self
            .students
            .get_mut(&number)
            .ok_or(RegistryError::NotFound(LookupKey::Number(number)))?;
        self.by_identity.insert(identity.id, number);
        record.platform_identity = Some(identity);
        Ok(record.clone())
    }

    /// # Errors
    /// Returns [`RegistryError::NotFound`] when no student holds `secret`.
    pub fn find_by_secret(&self, secret: &str) -> Result<&StudentRecord, RegistryError> {
        let not_found = RegistryError::NotFound(LookupKey::Secret);
        let secret = Secret::parse(secret).map_err(|_| not_found.clone())?;
        self.by_secret
            .get(&secret)
            .and_then(|number| self.students.get(number))
            .ok_or(not_found)
    }

    /// # Errors
    /// Returns [`RegistryError::NotFound`] when no registered student is bound
    /// to `identity_id`.
    pub fn find_by_identity(&self, identity_id: u64) -> Result<&StudentRecord, RegistryError> {
        self.by_identity
            .get(&identity_id)
            .and_then(|number| self.students.get(number))
            .ok_or(RegistryError::NotFound(LookupKey::Identity(identity_id)))
    }

    /// # Errors
    /// Returns [`RegistryError::NotFound`] when no student has `number`.
    pub fn find_by_number(&self, number: StudentNumber) -> Result<&StudentRecord, RegistryError> {
        self.students.get(&number).ok_or(RegistryError::NotFound(LookupKey::Number(number)))
    }

    fn attach(&mut self, record: StudentRecord) {
        let number = record.number;
        self.by_secret.insert(record.secret.clone(), number);
        if let Some(identity) = &record.platform_identity {
            self.by_identity.insert(identity.id, number);
        }
        self.students.insert(number, record);
    }

    fn detach(&mut self, number: StudentNumber) -> Option<StudentRecord> {
        let record = self.students.remove(&number)?;
        self.by_secret.remove(&record.secret);
        if let Some(identity) = &record.platform_identity {
            self.by_identity.remove(&identity.id);
        }
        Some(record)
    }
}
