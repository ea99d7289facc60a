/// Data models for the token queue.
///
/// This module defines the records the queue works with:
/// - Hospital: descriptive fields plus the two queue counters
/// - Patient: the person an appointment belongs to
/// - Appointment: one token handed out at one hospital on one day
/// - AppointmentStatus: where an appointment is in its lifecycle
/// - PatientSummary: the slim view returned when the counter moves

use crate::error::QueueError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! record_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = QueueError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value.trim())
                    .map($name)
                    .map_err(|_| QueueError::InvalidInput(format!("Invalid {} ID: '{}'", $label, value)))
            }
        }
    };
}

record_id!(HospitalId, "hospital");
record_id!(PatientId, "patient");
record_id!(AppointmentId, "appointment");

/// Lifecycle of an appointment.
///
/// Status only moves forward: Waiting, then In Consultation, then
/// Completed. Completed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Waiting,
    #[serde(rename = "In Consultation", alias = "InConsultation")]
    InConsultation,
    Completed,
}

impl AppointmentStatus {
    /// Convert a string to an AppointmentStatus value.
    pub fn from_string(value: &str) -> Result<Self, QueueError> {
        match value.to_lowercase().replace(['_', '-', ' '], "").as_str() {
            "waiting" => Ok(AppointmentStatus::Waiting),
            "inconsultation" => Ok(AppointmentStatus::InConsultation),
            "completed" => Ok(AppointmentStatus::Completed),
            _ => Err(QueueError::InvalidInput(format!(
                "Invalid status: '{}'. Must be one of: Waiting, In Consultation, Completed",
                value
            ))),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            AppointmentStatus::Waiting => "Waiting",
            AppointmentStatus::InConsultation => "In Consultation",
            AppointmentStatus::Completed => "Completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == AppointmentStatus::Completed
    }

    /// Whether a move to `next` keeps the lifecycle moving forward.
    pub fn can_transition_to(&self, next: AppointmentStatus) -> bool {
        !self.is_terminal() && next >= *self
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of a hospital's two queue counters.
///
/// `issued` is the next token to hand out. `serving` is the token at the
/// counter right now; every token below it is done. `serving == issued`
/// means nobody is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub issued: u64,
    pub serving: u64,
}

impl Counters {
    pub const START: Counters = Counters { issued: 1, serving: 1 };

    /// Number of issued tokens not yet called.
    pub fn waiting(&self) -> u64 {
        self.issued.saturating_sub(self.serving)
    }

    /// Take the next token. Returns the allocated token.
    pub fn issue(&mut self) -> u64 {
        let token = self.issued;
        self.issued += 1;
        token
    }

    /// Undo `issue` for `token`, but only if nothing was issued after it.
    pub fn release(&mut self, token: u64) -> bool {
        if self.issued == token + 1 && token >= self.serving {
            self.issued = token;
            true
        } else {
            false
        }
    }

    /// Move the serving counter forward unless it would pass `issued`.
    pub fn advance(&mut self) -> ServingAdvance {
        if self.serving < self.issued {
            self.serving += 1;
            ServingAdvance { serving: self.serving, advanced: true }
        } else {
            ServingAdvance { serving: self.serving, advanced: false }
        }
    }

    pub fn reset(&mut self) {
        *self = Counters::START;
    }
}

impl Default for Counters {
    fn default() -> Self {
        Counters::START
    }
}

/// Result of `increment_serving`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServingAdvance {
    pub serving: u64,
    /// False when the queue was exhausted and the counter stayed put.
    pub advanced: bool,
}

/// Represents a hospital and its queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hospital {
    pub id: HospitalId,
    pub name: String,
    pub address: String,
    pub contact_number: String,
    pub doctors_available_status: bool,
    pub current_token_being_served: u64,
    pub live_counter: u64,
    pub created_at: DateTime<Utc>,
}

impl Hospital {
    /// Create a new hospital with validation. Counters start at 1.
    pub fn new(name: String, address: String, contact_number: String) -> Result<Self, QueueError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(QueueError::InvalidInput("Hospital name cannot be empty".to_string()));
        }
        let address = address.trim().to_string();
        if address.is_empty() {
            return Err(QueueError::InvalidInput("Hospital address cannot be empty".to_string()));
        }
        let contact_number = contact_number.trim().to_string();
        if contact_number.is_empty() {
            return Err(QueueError::InvalidInput(
                "Hospital contact number cannot be empty".to_string(),
            ));
        }

        Ok(Hospital {
            id: HospitalId::new(),
            name,
            address,
            contact_number,
            doctors_available_status: false,
            current_token_being_served: Counters::START.issued,
            live_counter: Counters::START.serving,
            created_at: Utc::now(),
        })
    }

    pub fn counters(&self) -> Counters {
        Counters {
            issued: self.current_token_being_served,
            serving: self.live_counter,
        }
    }

    pub fn set_counters(&mut self, counters: Counters) {
        self.current_token_being_served = counters.issued;
        self.live_counter = counters.serving;
    }
}

/// Represents a patient who can hold appointments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: PatientId,
    pub name: String,
    pub phone: String,
    pub created_at: DateTime<Utc>,
}

impl Patient {
    /// Create a new patient with validation.
    pub fn new(name: String, phone: String) -> Result<Self, QueueError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(QueueError::InvalidInput("Patient name cannot be empty".to_string()));
        }
        let phone = phone.trim().to_string();
        if phone.is_empty() {
            return Err(QueueError::InvalidInput("Patient phone cannot be empty".to_string()));
        }

        Ok(Patient {
            id: PatientId::new(),
            name,
            phone,
            created_at: Utc::now(),
        })
    }
}

/// How a caller identifies the patient to register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatientLookup {
    Id(PatientId),
    Phone(String),
}

impl PatientLookup {
    /// Build a lookup from optional id and phone; the id wins when both are given.
    pub fn from_parts(patient_id: Option<&str>, phone: Option<&str>) -> Result<Self, QueueError> {
        match (patient_id.map(str::trim), phone.map(str::trim)) {
            (Some(id), _) if !id.is_empty() => Ok(PatientLookup::Id(id.parse()?)),
            (_, Some(phone)) if !phone.is_empty() => Ok(PatientLookup::Phone(phone.to_string())),
            _ => Err(QueueError::InvalidInput(
                "Either patientId or phone is required".to_string(),
            )),
        }
    }
}

impl fmt::Display for PatientLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatientLookup::Id(id) => write!(f, "with id {}", id),
            PatientLookup::Phone(phone) => write!(f, "with phone {}", phone),
        }
    }
}

/// One token handed out at one hospital.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: AppointmentId,
    pub patient_id: PatientId,
    pub patient_name: String,
    pub hospital_id: HospitalId,
    pub date_of_visit: DateTime<Utc>,
    /// Calendar day of `date_of_visit` in the queue's time zone.
    pub visit_day: NaiveDate,
    pub token_number: u64,
    pub status: AppointmentStatus,
}

impl Appointment {
    /// Create a waiting appointment for an already allocated token.
    pub fn new(
        patient: &Patient,
        patient_name: Option<String>,
        hospital_id: HospitalId,
        date_of_visit: DateTime<Utc>,
        visit_day: NaiveDate,
        token_number: u64,
    ) -> Result<Self, QueueError> {
        if token_number == 0 {
            return Err(QueueError::InvalidInput("Token numbers start at 1".to_string()));
        }
        let patient_name = patient_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| patient.name.clone());

        Ok(Appointment {
            id: AppointmentId::new(),
            patient_id: patient.id,
            patient_name,
            hospital_id,
            date_of_visit,
            visit_day,
            token_number,
            status: AppointmentStatus::Waiting,
        })
    }

    /// Move to `next`, refusing backward moves and edits after completion.
    pub fn transition(&mut self, next: AppointmentStatus) -> Result<(), QueueError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(QueueError::InvalidInput(format!(
                "Cannot change appointment status from {} to {}",
                self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn summary(&self) -> PatientSummary {
        PatientSummary {
            id: self.patient_id,
            name: self.patient_name.clone(),
            token_number: self.token_number,
        }
    }
}

/// The slim patient view shown on the live counter display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSummary {
    pub id: PatientId,
    pub name: String,
    pub token_number: u64,
}
