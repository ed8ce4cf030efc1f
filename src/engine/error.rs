use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

/// Field name → every message raised against it, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn get(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `Ok(())` when nothing was recorded, otherwise the whole collection.
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for message in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{field}: {message}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// A room that is already taken for part of the requested stay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConflict {
    pub room_id: Ulid,
    pub room_number: String,
    /// First requested night that collides.
    pub date: NaiveDate,
    pub reservation_id: Ulid,
}

impl fmt::Display for RoomConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "room {} is not available on {} (held by reservation {})",
            self.room_number, self.date, self.reservation_id
        )
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(FieldErrors),
    #[error("no rooms selected")]
    NoRoomsSelected,
    #[error("{0}")]
    Conflict(RoomConflict),
    #[error("reservation {0} is cancelled and read-only")]
    Locked(String),
    #[error("{0} is in the past and can no longer be modified")]
    HistoricDate(NaiveDate),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl EngineError {
    /// Build a one-field validation error.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.add(field, message);
        EngineError::Validation(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_aggregate_and_render() {
        let mut errors = FieldErrors::new();
        errors.add("total_amount", "must be greater than zero");
        errors.add("check_in_date", "is required");
        errors.add("total_amount", "must be a number");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.get("total_amount").len(), 2);
        assert_eq!(
            errors.to_string(),
            "check_in_date: is required; total_amount: must be greater than zero; total_amount: must be a number"
        );
        assert!(matches!(errors.into_result(), Err(EngineError::Validation(_))));
        assert!(FieldErrors::new().into_result().is_ok());
    }

    #[test]
    fn conflict_names_room_and_date() {
        let err = EngineError::Conflict(RoomConflict {
            room_id: Ulid::new(),
            room_number: "204".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, 12).unwrap(),
            reservation_id: Ulid::nil(),
        });
        let msg = err.to_string();
        assert!(msg.contains("room 204"));
        assert!(msg.contains("2024-01-12"));
    }
}
