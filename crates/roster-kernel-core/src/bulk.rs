use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::{RegistryError, Roster, StudentNumber, StudentRecord};

pub const EXPORT_HEADER: [&str; 6] =
    ["name", "number", "email", "external_identity_name", "external_identity_id", "secret"];

/// `first_name, last_name, email, number`
pub const IMPORT_COLUMNS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportRow {
    pub name: String,
    pub number: StudentNumber,
    pub email: String,
    pub external_identity_name: Option<String>,
    pub external_identity_id: Option<u64>,
    pub secret: String,
}

impl From<&StudentRecord> for ExportRow {
    fn from(record: &StudentRecord) -> Self {
        Self {
            name: record.name.clone(),
            number: record.number,
            email: record.email.clone(),
            external_identity_name: record
                .platform_identity
                .as_ref()
                .map(|identity| identity.name.clone()),
            external_identity_id: record.platform_identity.as_ref().map(|identity| identity.id),
            secret: record.secret.as_str().to_string(),
        }
    }
}

/// One parsed line of a roster upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRow {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub number: StudentNumber,
}

impl ImportRow {
    /// Parse the cells of one upload line.
    ///
    /// # Errors
    /// Returns [`RegistryError::Validation`] when the line does not have exactly
    /// [`IMPORT_COLUMNS`] cells or the number is not an unsigned integer.
    pub fn parse(cells: &[&str]) -> Result<Self, RegistryError> {
        let [first_name, last_name, email, number] = cells else {
            return Err(RegistryError::Validation(format!(
                "expected {IMPORT_COLUMNS} columns (first_name, last_name, email, number), got {}",
                cells.len()
            )));
        };
        let number = number.trim().parse::<u64>().map_err(|err| {
            RegistryError::Validation(format!("invalid student number `{}`: {err}", number.trim()))
        })?;

        Ok(Self {
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            email: email.trim().to_string(),
            number: StudentNumber(number),
        })
    }

    #[must_use]
    pub fn name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportFailure {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ImportSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<ImportFailure>,
}

impl ImportSummary {
    fn fail(&mut self, line: u64, reason: impl Into<String>) {
        self.failure_count += 1;
        self.failures.push(ImportFailure { line, reason: reason.into() });
    }
}

/// Write the export header followed by `rows`.
///
/// # Errors
/// Returns an error when a row cannot be serialized or the writer fails.
pub fn write_export_csv<W: Write>(rows: &[ExportRow], writer: W) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
    writer.write_record(EXPORT_HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

impl Roster {
    /// One export row per student, ordered by number.
    #[must_use]
    pub fn export_rows(&self) -> Vec<ExportRow> {
        self.iter().map(ExportRow::from).collect()
    }

    /// # Errors
    /// Returns [`RegistryError::NotFound`] when no student has `number`.
    pub fn export_student_rows(
        &self,
        number: StudentNumber,
    ) -> Result<Vec<ExportRow>, RegistryError> {
        Ok(vec![ExportRow::from(self.find_by_number(number)?)])
    }

    /// Add every already-split row, tallying failures instead of stopping.
    pub fn import_rows<I, R, S>(&mut self, rows: I, has_header: bool, overwrite: bool) -> ImportSummary
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[S]>,
        S: AsRef<str>,
    {
        let mut summary = ImportSummary::default();
        for (index, row) in rows.into_iter().enumerate().skip(usize::from(has_header)) {
            let line = u64::try_from(index + 1).unwrap_or(u64::MAX);
            let cells = row.as_ref().iter().map(AsRef::<str>::as_ref).collect::<Vec<&str>>();
            match self.import_cells(&cells, overwrite) {
                Ok(_) => summary.success_count += 1,
                Err(err) => summary.fail(line, err.to_string()),
            }
        }
        summary
    }

    /// Read a CSV upload and add every row. Unreadable or malformed rows are
    /// counted as failures; the rest of the batch continues.
    pub fn import_csv<R: Read>(&mut self, input: R, has_header: bool, overwrite: bool) -> ImportSummary {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input);

        let mut summary = ImportSummary::default();
        let mut skip_header = has_header;
        let mut record = csv::StringRecord::new();
        loop {
            let line = reader.position().line();
            match reader.read_record(&mut record) {
                Ok(false) => break,
                Ok(true) => {
                    if skip_header {
                        skip_header = false;
                        continue;
                    }
                    let line = record.position().map_or(line, csv::Position::line);
                    let cells = record.iter().collect::<Vec<&str>>();
                    match self.import_cells(&cells, overwrite) {
                        Ok(_) => summary.success_count += 1,
                        Err(err) => summary.fail(line, err.to_string()),
                    }
                }
                Err(err) if err.is_io_error() => {
                    summary.fail(line, format!("unreadable input: {err}"));
                    break;
                }
                Err(err) => {
                    if skip_header {
                        skip_header = false;
                        continue;
                    }
                    let line = err.position().map_or(line, csv::Position::line);
                    summary.fail(line, format!("unreadable row: {err}"));
                }
            }
        }
        summary
    }

    fn import_cells(&mut self, cells: &[&str], overwrite: bool) -> Result<StudentRecord, RegistryError> {
        let row = ImportRow::parse(cells)?;
        self.add(&row.name(), row.number, &row.email, overwrite)
    }
}
