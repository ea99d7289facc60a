/// In-memory backend.
///
/// Each hospital record sits behind its own mutex, so counter updates for
/// one hospital never wait on another. Patients and appointments share
/// one lock; those operations are short map edits.

use super::{day_prefix, slot_key, CounterStore, HospitalRepository, PatientRepository};
use crate::error::{QueueError, QueueResult};
use crate::models::{
    Appointment, AppointmentId, AppointmentStatus, Counters, Hospital, HospitalId, Patient,
    PatientId, PatientLookup, ServingAdvance,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct PatientBook {
    patients: HashMap<PatientId, Patient>,
    by_phone: HashMap<String, PatientId>,
    appointments: HashMap<AppointmentId, Appointment>,
    slots: BTreeMap<String, AppointmentId>,
}

impl PatientBook {
    fn owned_appointment_mut(
        &mut self,
        patient_id: PatientId,
        appointment_id: AppointmentId,
    ) -> QueueResult<&mut Appointment> {
        if !self.patients.contains_key(&patient_id) {
            return Err(QueueError::patient_not_found(format!("with id {}", patient_id)));
        }
        self.appointments
            .get_mut(&appointment_id)
            .filter(|apt| apt.patient_id == patient_id)
            .ok_or_else(|| QueueError::appointment_not_found(appointment_id))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    hospitals: RwLock<HashMap<HospitalId, Arc<Mutex<Hospital>>>>,
    book: RwLock<PatientBook>,
}

fn poisoned<T>(_: T) -> QueueError {
    QueueError::Internal("in-memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn hospital_cell(&self, hospital_id: HospitalId) -> QueueResult<Arc<Mutex<Hospital>>> {
        let hospitals = self.hospitals.read().map_err(poisoned)?;
        hospitals
            .get(&hospital_id)
            .cloned()
            .ok_or_else(|| QueueError::hospital_not_found(hospital_id))
    }

    /// Run `f` on one hospital record while holding only that hospital's lock.
    fn with_hospital<T>(&self, hospital_id: HospitalId, f: impl FnOnce(&mut Hospital) -> T) -> QueueResult<T> {
        let cell = self.hospital_cell(hospital_id)?;
        let mut hospital: MutexGuard<'_, Hospital> = cell.lock().map_err(poisoned)?;
        Ok(f(&mut hospital))
    }

    fn with_counters<T>(&self, hospital_id: HospitalId, f: impl FnOnce(&mut Counters) -> T) -> QueueResult<T> {
        self.with_hospital(hospital_id, |hospital| {
            let mut counters = hospital.counters();
            let value = f(&mut counters);
            hospital.set_counters(counters);
            value
        })
    }

    fn read_book(&self) -> QueueResult<RwLockReadGuard<'_, PatientBook>> {
        self.book.read().map_err(poisoned)
    }

    fn write_book(&self) -> QueueResult<RwLockWriteGuard<'_, PatientBook>> {
        self.book.write().map_err(poisoned)
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn counters(&self, hospital_id: HospitalId) -> QueueResult<Counters> {
        self.with_hospital(hospital_id, |hospital| hospital.counters())
    }

    async fn increment_issued(&self, hospital_id: HospitalId) -> QueueResult<u64> {
        self.with_counters(hospital_id, Counters::issue)
    }

    async fn release_issued(&self, hospital_id: HospitalId, token: u64) -> QueueResult<bool> {
        self.with_counters(hospital_id, |counters| counters.release(token))
    }

    async fn increment_serving(&self, hospital_id: HospitalId) -> QueueResult<ServingAdvance> {
        self.with_counters(hospital_id, Counters::advance)
    }

    async fn hospital_ids(&self) -> QueueResult<Vec<HospitalId>> {
        let hospitals = self.hospitals.read().map_err(poisoned)?;
        let mut ids: Vec<HospitalId> = hospitals.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn reset(&self, hospital_id: HospitalId) -> QueueResult<()> {
        self.with_counters(hospital_id, Counters::reset)
    }
}

#[async_trait]
impl HospitalRepository for MemoryStore {
    async fn insert_hospital(&self, hospital: Hospital) -> QueueResult<Hospital> {
        let mut hospitals = self.hospitals.write().map_err(poisoned)?;
        for existing in hospitals.values() {
            let existing = existing.lock().map_err(poisoned)?;
            if existing.name.eq_ignore_ascii_case(&hospital.name) {
                return Err(QueueError::Conflict(format!(
                    "Hospital named '{}' already exists",
                    hospital.name
                )));
            }
        }
        hospitals.insert(hospital.id, Arc::new(Mutex::new(hospital.clone())));
        Ok(hospital)
    }

    async fn find_hospital(&self, hospital_id: HospitalId) -> QueueResult<Hospital> {
        self.with_hospital(hospital_id, |hospital| hospital.clone())
    }

    async fn list_hospitals(&self) -> QueueResult<Vec<Hospital>> {
        let cells: Vec<Arc<Mutex<Hospital>>> = {
            let hospitals = self.hospitals.read().map_err(poisoned)?;
            hospitals.values().cloned().collect()
        };
        let mut list = Vec::with_capacity(cells.len());
        for cell in cells {
            list.push(cell.lock().map_err(poisoned)?.clone());
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn set_doctors_available(&self, hospital_id: HospitalId, available: bool) -> QueueResult<Hospital> {
        self.with_hospital(hospital_id, |hospital| {
            hospital.doctors_available_status = available;
            hospital.clone()
        })
    }
}

#[async_trait]
impl PatientRepository for MemoryStore {
    async fn insert_patient(&self, patient: Patient) -> QueueResult<Patient> {
        let mut book = self.write_book()?;
        if book.by_phone.contains_key(&patient.phone) {
            return Err(QueueError::Conflict(format!(
                "Patient with phone {} already exists",
                patient.phone
            )));
        }
        book.by_phone.insert(patient.phone.clone(), patient.id);
        book.patients.insert(patient.id, patient.clone());
        Ok(patient)
    }

    async fn find_by_phone_or_id(&self, lookup: &PatientLookup) -> QueueResult<Patient> {
        let book = self.read_book()?;
        let found = match lookup {
            PatientLookup::Id(id) => book.patients.get(id),
            PatientLookup::Phone(phone) => book.by_phone.get(phone).and_then(|id| book.patients.get(id)),
        };
        found.cloned().ok_or_else(|| QueueError::patient_not_found(lookup))
    }

    async fn append_appointment(&self, appointment: Appointment) -> QueueResult<Appointment> {
        let mut book = self.write_book()?;
        if !book.patients.contains_key(&appointment.patient_id) {
            return Err(QueueError::patient_not_found(format!("with id {}", appointment.patient_id)));
        }
        let key = slot_key(appointment.hospital_id, appointment.visit_day, appointment.token_number);
        book.slots.insert(key, appointment.id);
        book.appointments.insert(appointment.id, appointment.clone());
        Ok(appointment)
    }

    async fn find_appointment_by_hospital_token_and_day(
        &self,
        hospital_id: HospitalId,
        token_number: u64,
        day: NaiveDate,
    ) -> QueueResult<Option<Appointment>> {
        let book = self.read_book()?;
        Ok(book
            .slots
            .get(&slot_key(hospital_id, day, token_number))
            .and_then(|id| book.appointments.get(id))
            .cloned())
    }

    async fn update_appointment_status(
        &self,
        patient_id: PatientId,
        appointment_id: AppointmentId,
        status: AppointmentStatus,
    ) -> QueueResult<Appointment> {
        let mut book = self.write_book()?;
        let appointment = book.owned_appointment_mut(patient_id, appointment_id)?;
        appointment.transition(status)?;
        Ok(appointment.clone())
    }

    async fn appointments_for_patient(&self, patient_id: PatientId) -> QueueResult<Vec<Appointment>> {
        let book = self.read_book()?;
        if !book.patients.contains_key(&patient_id) {
            return Err(QueueError::patient_not_found(format!("with id {}", patient_id)));
        }
        let mut appointments: Vec<Appointment> = book
            .appointments
            .values()
            .filter(|apt| apt.patient_id == patient_id)
            .cloned()
            .collect();
        appointments.sort_by_key(|apt| (apt.date_of_visit, apt.token_number));
        Ok(appointments)
    }

    async fn appointments_for_day(&self, hospital_id: HospitalId, day: NaiveDate) -> QueueResult<Vec<Appointment>> {
        let book = self.read_book()?;
        let prefix = day_prefix(hospital_id, day);
        Ok(book
            .slots
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(_, id)| book.appointments.get(id))
            .cloned()
            .collect())
    }

    async fn delete_appointment(&self, patient_id: PatientId, appointment_id: AppointmentId) -> QueueResult<Appointment> {
        let mut book = self.write_book()?;
        let appointment = book.owned_appointment_mut(patient_id, appointment_id)?;
        if appointment.status.is_terminal() {
            return Err(QueueError::InvalidInput(
                "Cannot delete a completed appointment".to_string(),
            ));
        }
        let removed = appointment.clone();
        book.appointments.remove(&appointment_id);
        let key = slot_key(removed.hospital_id, removed.visit_day, removed.token_number);
        if book.slots.get(&key) == Some(&appointment_id) {
            book.slots.remove(&key);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn hospital(name: &str) -> Hospital {
        Hospital::new(name.to_string(), "MG Road".to_string(), "080-1234".to_string()).unwrap()
    }

    #[tokio::test]
    async fn unknown_hospital_is_not_found() {
        let store = MemoryStore::new();
        let err = store.increment_issued(HospitalId::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_names_and_phones_conflict() {
        let store = MemoryStore::new();
        store.insert_hospital(hospital("City Care")).await.unwrap();
        let err = store.insert_hospital(hospital("city care")).await.unwrap_err();
        assert!(matches!(err, QueueError::Conflict(_)));

        let patient = Patient::new("Ravi".to_string(), "99000".to_string()).unwrap();
        store.insert_patient(patient).await.unwrap();
        let twin = Patient::new("Ravi K".to_string(), "99000".to_string()).unwrap();
        assert!(matches!(store.insert_patient(twin).await, Err(QueueError::Conflict(_))));
    }

    #[tokio::test]
    async fn day_listing_is_ordered_and_scoped() {
        let store = MemoryStore::new();
        let h = store.insert_hospital(hospital("General")).await.unwrap();
        let other = store.insert_hospital(hospital("Other")).await.unwrap();
        let patient = store
            .insert_patient(Patient::new("Meera".to_string(), "12345".to_string()).unwrap())
            .await
            .unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let next_day = day.succ_opt().unwrap();

        for (hid, d, token) in [(h.id, day, 10), (h.id, day, 2), (h.id, next_day, 1), (other.id, day, 3)] {
            let apt = Appointment::new(&patient, None, hid, Utc::now(), d, token).unwrap();
            store.append_appointment(apt).await.unwrap();
        }

        let tokens: Vec<u64> = store
            .appointments_for_day(h.id, day)
            .await
            .unwrap()
            .iter()
            .map(|apt| apt.token_number)
            .collect();
        assert_eq!(tokens, vec![2, 10]);
    }

    #[tokio::test]
    async fn completed_appointments_cannot_be_deleted() {
        let store = MemoryStore::new();
        let h = store.insert_hospital(hospital("General")).await.unwrap();
        let patient = store
            .insert_patient(Patient::new("Meera".to_string(), "12345".to_string()).unwrap())
            .await
            .unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let apt = store
            .append_appointment(Appointment::new(&patient, None, h.id, Utc::now(), day, 1).unwrap())
            .await
            .unwrap();

        store
            .update_appointment_status(patient.id, apt.id, AppointmentStatus::Completed)
            .await
            .unwrap();
        let err = store.delete_appointment(patient.id, apt.id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));

        let err = store
            .update_appointment_status(patient.id, apt.id, AppointmentStatus::Waiting)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn deleting_frees_the_slot() {
        let store = MemoryStore::new();
        let h = store.insert_hospital(hospital("General")).await.unwrap();
        let patient = store
            .insert_patient(Patient::new("Meera".to_string(), "12345".to_string()).unwrap())
            .await
            .unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let apt = store
            .append_appointment(Appointment::new(&patient, None, h.id, Utc::now(), day, 1).unwrap())
            .await
            .unwrap();

        store.delete_appointment(patient.id, apt.id).await.unwrap();
        let found = store.find_appointment_by_hospital_token_and_day(h.id, 1, day).await.unwrap();
        assert!(found.is_none());
        let err = store.delete_appointment(PatientId::new(), apt.id).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }
}
