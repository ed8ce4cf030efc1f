//! Housekeeping status lookup consumed by the room display resolver.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::model::Room;

/// Code a provider returns for a room that still needs cleaning.
pub const NEEDS_CLEANING: &str = "pendiente";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleaningStatus {
    pub code: String,
    pub label: String,
    pub color: String,
    pub icon: String,
}

impl CleaningStatus {
    pub fn new(code: &str, label: &str, color: &str, icon: &str) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
            color: color.into(),
            icon: icon.into(),
        }
    }

    pub fn clean() -> Self {
        Self::new("limpia", "Limpia", "green", "sparkles")
    }

    pub fn needs_cleaning_status() -> Self {
        Self::new(NEEDS_CLEANING, "Pendiente por limpiar", "yellow", "broom")
    }

    /// Shown when the provider could not answer.
    pub fn unknown() -> Self {
        Self::new("desconocido", "Estado de limpieza no disponible", "gray", "question")
    }

    pub fn needs_cleaning(&self) -> bool {
        self.code == NEEDS_CLEANING
    }
}

#[derive(Debug, Error)]
#[error("cleaning status unavailable: {0}")]
pub struct LookupError(pub String);

#[async_trait]
pub trait CleaningStatusProvider: Send + Sync {
    async fn cleaning_status(&self, room: &Room, date: NaiveDate) -> Result<CleaningStatus, LookupError>;
}

/// Provider for properties without housekeeping data: every room is clean.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysClean;

#[async_trait]
impl CleaningStatusProvider for AlwaysClean {
    async fn cleaning_status(&self, _room: &Room, _date: NaiveDate) -> Result<CleaningStatus, LookupError> {
        Ok(CleaningStatus::clean())
    }
}
