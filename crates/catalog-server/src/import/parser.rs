//! Streaming CSV parser
//!
//! Turns a staged upload into a lazy stream of normalized [`RowRecord`]s.
//! Rows without a usable key or name are dropped here and never reach the
//! upsert step.

use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use super::source::SourceReader;
use super::{ImportError, ImportResult};

/// Accepted header names for the natural key, in lookup order
const KEY_COLUMNS: &[&str] = &["sku", "key"];
const NAME_COLUMN: &str = "name";
const DESCRIPTION_COLUMN: &str = "description";

/// Why a row was dropped
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRejection {
    #[error("row has no key")]
    MissingKey,
    #[error("row has no name")]
    MissingName,
}

/// One normalized catalog row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRecord {
    /// Trimmed and lower-cased natural key
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub active: bool,
}

impl RowRecord {
    /// Normalize raw field values into a record.
    pub fn from_fields(
        key: Option<&str>,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Self, RowRejection> {
        let sku = key.map(normalize_key).unwrap_or_default();
        if sku.is_empty() {
            return Err(RowRejection::MissingKey);
        }

        let name = name.map(str::trim).unwrap_or_default();
        if name.is_empty() {
            return Err(RowRejection::MissingName);
        }

        let description = description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        Ok(Self {
            sku,
            name: name.to_string(),
            description,
            active: true,
        })
    }
}

/// Trimmed, lower-cased form used for case-insensitive key matching.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Field positions resolved from the header row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    key: usize,
    name: usize,
    description: Option<usize>,
}

impl Columns {
    fn resolve(headers: &StringRecord) -> ImportResult<Self> {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_lowercase())
            .collect();
        let find = |name: &str| normalized.iter().position(|h| h == name);

        let key = KEY_COLUMNS
            .iter()
            .find_map(|candidate| find(candidate))
            .ok_or_else(|| {
                ImportError::Parse("header row has no 'sku' (or 'key') column".to_string())
            })?;
        let name = find(NAME_COLUMN)
            .ok_or_else(|| ImportError::Parse("header row has no 'name' column".to_string()))?;

        Ok(Self {
            key,
            name,
            description: find(DESCRIPTION_COLUMN),
        })
    }

    fn extract(&self, record: &StringRecord) -> Result<RowRecord, RowRejection> {
        RowRecord::from_fields(
            record.get(self.key),
            record.get(self.name),
            self.description.and_then(|i| record.get(i)),
        )
    }
}

pub type RowStream = BoxStream<'static, ImportResult<RowRecord>>;

/// Read the header row and return the stream of valid rows.
///
/// A missing key or name column fails immediately. Afterwards the stream
/// skips invalid rows and undecodable records, and yields an error only for
/// I/O failures of the underlying reader.
pub async fn parse_rows(reader: SourceReader) -> ImportResult<RowStream> {
    let mut csv = AsyncReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .create_reader(reader);

    let columns = Columns::resolve(csv.headers().await?)?;
    debug!(?columns, "Resolved CSV columns");

    let rows = csv
        .into_records()
        .filter_map(move |result| async move {
            match result {
                Ok(record) => match columns.extract(&record) {
                    Ok(row) => Some(Ok(row)),
                    Err(reason) => {
                        debug!(
                            line = record.position().map(|p| p.line()),
                            %reason,
                            "Skipping invalid row"
                        );
                        None
                    },
                },
                Err(e) if e.is_io_error() => Some(Err(ImportError::from(e))),
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable record");
                    None
                },
            }
        })
        .boxed();

    Ok(rows)
}

/// Count every data record in the source, valid or not.
///
/// Used for the job's `total_rows` estimate before the main pass.
pub async fn count_rows(reader: SourceReader) -> ImportResult<u64> {
    let csv = AsyncReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .create_reader(reader);

    let mut records = std::pin::pin!(csv.into_byte_records());
    let mut total = 0u64;

    while let Some(result) = records.next().await {
        match result {
            Ok(_) => total += 1,
            Err(e) if e.is_io_error() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Counting unreadable record");
                total += 1;
            },
        }
    }

    Ok(total)
}
