//! Storage seams for the queue.
//!
//! `CounterStore` owns the two per-hospital counters and must make every
//! counter update atomic for a single hospital. `HospitalRepository` and
//! `PatientRepository` cover the records around them. Both backends
//! (`MemoryStore`, `SledStore`) implement all three.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::error::QueueResult;
use crate::error::QueueError;
use crate::models::{
    Appointment, AppointmentId, AppointmentStatus, Counters, Hospital, HospitalId, Patient,
    PatientId, PatientLookup, ServingAdvance,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::warn;

#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn counters(&self, hospital_id: HospitalId) -> QueueResult<Counters>;

    /// Allocate the current `issued` value as a token and persist `issued + 1`.
    async fn increment_issued(&self, hospital_id: HospitalId) -> QueueResult<u64>;

    /// Give `token` back if it is still the most recently issued one.
    async fn release_issued(&self, hospital_id: HospitalId, token: u64) -> QueueResult<bool>;

    /// Move `serving` forward by one, never past `issued`.
    async fn increment_serving(&self, hospital_id: HospitalId) -> QueueResult<ServingAdvance>;

    async fn hospital_ids(&self) -> QueueResult<Vec<HospitalId>>;

    async fn reset(&self, hospital_id: HospitalId) -> QueueResult<()>;

    /// Reset every hospital. One failing hospital does not stop the rest.
    async fn reset_all(&self) -> QueueResult<ResetReport> {
        let mut report = ResetReport::default();
        for hospital_id in self.hospital_ids().await? {
            match self.reset(hospital_id).await {
                Ok(()) => report.reset.push(hospital_id),
                Err(err) => {
                    warn!(%hospital_id, error = %err, "failed to reset counters");
                    report.failed.push((hospital_id, err));
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
pub trait HospitalRepository: CounterStore {
    async fn insert_hospital(&self, hospital: Hospital) -> QueueResult<Hospital>;

    async fn find_hospital(&self, hospital_id: HospitalId) -> QueueResult<Hospital>;

    async fn list_hospitals(&self) -> QueueResult<Vec<Hospital>>;

    async fn set_doctors_available(&self, hospital_id: HospitalId, available: bool) -> QueueResult<Hospital>;
}

#[async_trait]
pub trait PatientRepository: Send + Sync {
    /// Store a new patient. Phone numbers are unique.
    async fn insert_patient(&self, patient: Patient) -> QueueResult<Patient>;

    async fn find_by_phone_or_id(&self, lookup: &PatientLookup) -> QueueResult<Patient>;

    /// Store an appointment. The latest appointment for a
    /// (hospital, day, token) slot is the one lookups return.
    async fn append_appointment(&self, appointment: Appointment) -> QueueResult<Appointment>;

    async fn find_appointment_by_hospital_token_and_day(
        &self,
        hospital_id: HospitalId,
        token_number: u64,
        day: NaiveDate,
    ) -> QueueResult<Option<Appointment>>;

    async fn update_appointment_status(
        &self,
        patient_id: PatientId,
        appointment_id: AppointmentId,
        status: AppointmentStatus,
    ) -> QueueResult<Appointment>;

    async fn appointments_for_patient(&self, patient_id: PatientId) -> QueueResult<Vec<Appointment>>;

    /// Appointments at a hospital on one day, ordered by token.
    async fn appointments_for_day(&self, hospital_id: HospitalId, day: NaiveDate) -> QueueResult<Vec<Appointment>>;

    /// Remove an appointment. Completed appointments are kept.
    async fn delete_appointment(&self, patient_id: PatientId, appointment_id: AppointmentId) -> QueueResult<Appointment>;
}

/// Everything the HTTP layer needs from one backend.
pub trait QueueStore: HospitalRepository + PatientRepository {}

impl<T: HospitalRepository + PatientRepository> QueueStore for T {}

/// Outcome of `CounterStore::reset_all`.
#[derive(Debug, Default)]
pub struct ResetReport {
    pub reset: Vec<HospitalId>,
    pub failed: Vec<(HospitalId, QueueError)>,
}

impl ResetReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-hospital async locks that serialize issue/advance sequences.
///
/// The registry mutex is only held to look up or create a hospital's
/// lock, so different hospitals never wait on each other.
#[derive(Debug, Clone, Default)]
pub struct HospitalLocks {
    locks: Arc<Mutex<HashMap<HospitalId, Arc<AsyncMutex<()>>>>>,
}

impl HospitalLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, hospital_id: HospitalId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(hospital_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of hospitals that have ever been locked.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Key for the (hospital, day, token) appointment slot.
pub(crate) fn slot_key(hospital_id: HospitalId, day: NaiveDate, token_number: u64) -> String {
    format!("{}/{}/{:020}", hospital_id, day.format("%Y-%m-%d"), token_number)
}

pub(crate) fn day_prefix(hospital_id: HospitalId, day: NaiveDate) -> String {
    format!("{}/{}/", hospital_id, day.format("%Y-%m-%d"))
}
