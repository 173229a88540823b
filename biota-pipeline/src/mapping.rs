//! Row mappers turning provider payloads into canonical records.
//!
//! Each provider kind registers a [`RowMapper`]. The mapper only lifts
//! fields; validation and enrichment happen later in
//! [`biota_core::RecordEnricher`], so a mapper accepts rows with missing
//! coordinates or unknown taxa and leaves the verdict to the enricher.

use biota_core::{CanonicalObservation, OccurrenceStatus};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::source::RawRecord;

/// Provider details handed to every mapper call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderContext {
    /// Provider identifier stamped onto every record.
    pub provider_id: String,
    /// Provider kind tag.
    pub kind: String,
}

/// Row-level mapping failure. Counted as failed; never aborts a provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// The payload is not a JSON object.
    #[error("row {offset} is not a JSON object")]
    NotAnObject {
        /// Offset of the row.
        offset: u64,
    },
    /// A required field is absent.
    #[error("row {offset} lacks required field {field}")]
    MissingField {
        /// Offset of the row.
        offset: u64,
        /// Field name.
        field: &'static str,
    },
    /// A field holds a value of the wrong shape.
    #[error("row {offset} has invalid {field}: {message}")]
    InvalidField {
        /// Offset of the row.
        offset: u64,
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

/// Mapper signature shared by all provider kinds.
pub type RowMapper =
    fn(&RawRecord, &ProviderContext) -> Result<CanonicalObservation, MappingError>;

/// Map a Darwin Core style JSON object.
///
/// Recognised terms are `occurrenceID`, `taxonID`, `decimalLongitude`,
/// `decimalLatitude`, `coordinateUncertaintyInMeters`, `occurrenceStatus`,
/// `locality` and the provider extension `freeUsage`. Rows without an
/// `occurrenceID` are keyed `{provider_id}-{offset}`.
///
/// # Errors
///
/// Returns [`MappingError`] when the payload is not an object, lacks a
/// `taxonID`, or holds a recognised term of the wrong type.
pub fn map_darwin_core(
    record: &RawRecord,
    context: &ProviderContext,
) -> Result<CanonicalObservation, MappingError> {
    let offset = record.offset;
    let Value::Object(fields) = &record.payload else {
        return Err(MappingError::NotAnObject { offset });
    };
    let row = Row { offset, fields };

    let taxon_id = row
        .integer("taxonID")?
        .ok_or(MappingError::MissingField {
            offset,
            field: "taxonID",
        })?;
    let stable_key = row
        .text("occurrenceID")?
        .unwrap_or_else(|| format!("{}-{offset}", context.provider_id));
    let mut observation =
        CanonicalObservation::new(context.provider_id.clone(), stable_key, taxon_id);

    match (row.number("decimalLongitude")?, row.number("decimalLatitude")?) {
        (Some(longitude), Some(latitude)) => {
            observation = observation.with_coordinates(longitude, latitude);
        }
        (None, None) => {}
        (Some(_), None) => {
            return Err(MappingError::MissingField {
                offset,
                field: "decimalLatitude",
            });
        }
        (None, Some(_)) => {
            return Err(MappingError::MissingField {
                offset,
                field: "decimalLongitude",
            });
        }
    }
    if let Some(metres) = row.integer("coordinateUncertaintyInMeters")? {
        let bounded = u32::try_from(metres).map_err(|_| MappingError::InvalidField {
            offset,
            field: "coordinateUncertaintyInMeters",
            message: format!("{metres} is out of range"),
        })?;
        observation = observation.with_uncertainty(bounded);
    }
    if let Some(status) = row.text("occurrenceStatus")? {
        observation = observation.with_status(parse_status(offset, &status)?);
    }
    if let Some(locality) = row.text("locality")? {
        observation = observation.with_locality(locality);
    }
    if let Some(allowed) = row.flag("freeUsage")? {
        observation = observation.with_free_usage(allowed);
    }
    Ok(observation)
}

fn parse_status(offset: u64, value: &str) -> Result<OccurrenceStatus, MappingError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "present" => Ok(OccurrenceStatus::Present),
        "absent" => Ok(OccurrenceStatus::Absent),
        other => Err(MappingError::InvalidField {
            offset,
            field: "occurrenceStatus",
            message: format!("unknown status '{other}'"),
        }),
    }
}

/// Typed accessors over one payload. Absent and `null` terms read as `None`.
struct Row<'a> {
    offset: u64,
    fields: &'a Map<String, Value>,
}

impl Row<'_> {
    fn present(&self, field: &'static str) -> Option<&Value> {
        self.fields.get(field).filter(|value| !value.is_null())
    }

    fn invalid(&self, field: &'static str, message: impl Into<String>) -> MappingError {
        MappingError::InvalidField {
            offset: self.offset,
            field,
            message: message.into(),
        }
    }

    fn text(&self, field: &'static str) -> Result<Option<String>, MappingError> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::String(text)) if text.trim().is_empty() => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(Value::Number(number)) => Ok(Some(number.to_string())),
            Some(_) => Err(self.invalid(field, "expected a string")),
        }
    }

    fn integer(&self, field: &'static str) -> Result<Option<u64>, MappingError> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::Number(number)) => number
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(field, format!("{number} is not a whole number"))),
            Some(Value::String(text)) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(field, format!("'{text}' is not a whole number"))),
            Some(_) => Err(self.invalid(field, "expected a whole number")),
        }
    }

    fn number(&self, field: &'static str) -> Result<Option<f64>, MappingError> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::Number(number)) => number
                .as_f64()
                .map(Some)
                .ok_or_else(|| self.invalid(field, format!("{number} is not a number"))),
            Some(Value::String(text)) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| self.invalid(field, format!("'{text}' is not a number"))),
            Some(_) => Err(self.invalid(field, "expected a number")),
        }
    }

    fn flag(&self, field: &'static str) -> Result<Option<bool>, MappingError> {
        match self.present(field) {
            None => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(_) => Err(self.invalid(field, "expected true or false")),
        }
    }
}
