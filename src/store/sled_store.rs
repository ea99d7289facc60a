/// Persistent backend on sled.
///
/// Trees:
/// - `hospitals`: hospital id -> hospital JSON (counters live here)
/// - `patients`: patient id -> patient JSON
/// - `phones`: phone -> patient id
/// - `appointments`: appointment id -> appointment JSON
/// - `slots`: `hospital/day/token` -> appointment id
///
/// Every counter update is one sled transaction on the hospital's key, so
/// concurrent callers are serialized per key by sled's conflict detection.

use super::{day_prefix, slot_key, CounterStore, HospitalRepository, PatientRepository};
use crate::error::{QueueError, QueueResult};
use crate::models::{
    Appointment, AppointmentId, AppointmentStatus, Counters, Hospital, HospitalId, Patient,
    PatientId, PatientLookup, ServingAdvance,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Transactional, Tree};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

pub struct SledStore {
    db: sled::Db,
    hospitals: Tree,
    patients: Tree,
    phones: Tree,
    appointments: Tree,
    slots: Tree,
}

type TxResult<T> = Result<T, ConflictableTransactionError<QueueError>>;

fn encode<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn decode<T: DeserializeOwned>(raw: &[u8]) -> TxResult<T> {
    serde_json::from_slice(raw).map_err(|e| ConflictableTransactionError::Abort(e.into()))
}

fn abort<T>(err: QueueError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err))
}

fn flatten(err: TransactionError<QueueError>) -> QueueError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => err.into(),
    }
}

fn uuid_from(raw: &[u8]) -> QueueResult<Uuid> {
    Uuid::from_slice(raw).map_err(|e| QueueError::Internal(format!("corrupt id in store: {}", e)))
}

fn load_appointment(tx: &TransactionalTree, appointment_id: AppointmentId) -> TxResult<Appointment> {
    match tx.get(appointment_id.0.as_bytes())? {
        Some(raw) => decode(&raw),
        None => abort(QueueError::appointment_not_found(appointment_id)),
    }
}

impl SledStore {
    /// Open (or create) the database under `path`.
    pub fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening sled store");
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database that is removed when dropped.
    pub fn temporary() -> QueueResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> QueueResult<Self> {
        Ok(SledStore {
            hospitals: db.open_tree("hospitals")?,
            patients: db.open_tree("patients")?,
            phones: db.open_tree("phones")?,
            appointments: db.open_tree("appointments")?,
            slots: db.open_tree("slots")?,
            db,
        })
    }

    pub async fn flush(&self) -> QueueResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Atomically read, change and write back one hospital record.
    fn update_hospital<T>(
        &self,
        hospital_id: HospitalId,
        f: impl Fn(&mut Hospital) -> QueueResult<T>,
    ) -> QueueResult<T> {
        let key = hospital_id.0.as_bytes();
        self.hospitals
            .transaction(|tx| {
                let mut hospital: Hospital = match tx.get(key)? {
                    Some(raw) => decode(&raw)?,
                    None => return abort(QueueError::hospital_not_found(hospital_id)),
                };
                let value = f(&mut hospital).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(&key[..], encode(&hospital)?)?;
                Ok(value)
            })
            .map_err(flatten)
    }

    fn update_counters<T>(
        &self,
        hospital_id: HospitalId,
        f: impl Fn(&mut Counters) -> T,
    ) -> QueueResult<T> {
        self.update_hospital(hospital_id, |hospital| {
            let mut counters = hospital.counters();
            let value = f(&mut counters);
            hospital.set_counters(counters);
            Ok(value)
        })
    }

    fn get_json<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> QueueResult<Option<T>> {
        match tree.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn get_appointment(&self, appointment_id: AppointmentId) -> QueueResult<Option<Appointment>> {
        Self::get_json(&self.appointments, appointment_id.0.as_bytes())
    }

    fn ensure_patient(&self, patient_id: PatientId) -> QueueResult<()> {
        if self.patients.contains_key(patient_id.0.as_bytes())? {
            Ok(())
        } else {
            Err(QueueError::patient_not_found(format!("with id {}", patient_id)))
        }
    }
}

#[async_trait]
impl CounterStore for SledStore {
    async fn counters(&self, hospital_id: HospitalId) -> QueueResult<Counters> {
        self.find_hospital(hospital_id).await.map(|h| h.counters())
    }

    async fn increment_issued(&self, hospital_id: HospitalId) -> QueueResult<u64> {
        self.update_counters(hospital_id, Counters::issue)
    }

    async fn release_issued(&self, hospital_id: HospitalId, token: u64) -> QueueResult<bool> {
        self.update_counters(hospital_id, |counters| counters.release(token))
    }

    async fn increment_serving(&self, hospital_id: HospitalId) -> QueueResult<ServingAdvance> {
        self.update_counters(hospital_id, Counters::advance)
    }

    async fn hospital_ids(&self) -> QueueResult<Vec<HospitalId>> {
        self.hospitals
            .iter()
            .keys()
            .map(|key| -> QueueResult<HospitalId> { Ok(HospitalId(uuid_from(&key?)?)) })
            .collect()
    }

    async fn reset(&self, hospital_id: HospitalId) -> QueueResult<()> {
        self.update_counters(hospital_id, Counters::reset)
    }
}

#[async_trait]
impl HospitalRepository for SledStore {
    async fn insert_hospital(&self, hospital: Hospital) -> QueueResult<Hospital> {
        for existing in self.list_hospitals().await? {
            if existing.name.eq_ignore_ascii_case(&hospital.name) {
                return Err(QueueError::Conflict(format!(
                    "Hospital named '{}' already exists",
                    hospital.name
                )));
            }
        }
        let encoded = serde_json::to_vec(&hospital)?;
        let inserted = self
            .hospitals
            .compare_and_swap(hospital.id.0.as_bytes(), None as Option<&[u8]>, Some(encoded))?;
        if inserted.is_err() {
            return Err(QueueError::Conflict(format!("Hospital {} already exists", hospital.id)));
        }
        Ok(hospital)
    }

    async fn find_hospital(&self, hospital_id: HospitalId) -> QueueResult<Hospital> {
        Self::get_json(&self.hospitals, hospital_id.0.as_bytes())?
            .ok_or_else(|| QueueError::hospital_not_found(hospital_id))
    }

    async fn list_hospitals(&self) -> QueueResult<Vec<Hospital>> {
        let mut list = Vec::new();
        for entry in self.hospitals.iter().values() {
            list.push(serde_json::from_slice::<Hospital>(&entry?)?);
        }
        list.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    async fn set_doctors_available(&self, hospital_id: HospitalId, available: bool) -> QueueResult<Hospital> {
        self.update_hospital(hospital_id, |hospital| {
            hospital.doctors_available_status = available;
            Ok(hospital.clone())
        })
    }
}

#[async_trait]
impl PatientRepository for SledStore {
    async fn insert_patient(&self, patient: Patient) -> QueueResult<Patient> {
        (&self.patients, &self.phones)
            .transaction(|(patients, phones)| {
                if phones.get(patient.phone.as_bytes())?.is_some() {
                    return abort(QueueError::Conflict(format!(
                        "Patient with phone {} already exists",
                        patient.phone
                    )));
                }
                phones.insert(patient.phone.as_bytes(), &patient.id.0.as_bytes()[..])?;
                patients.insert(&patient.id.0.as_bytes()[..], encode(&patient)?)?;
                Ok(())
            })
            .map_err(flatten)?;
        Ok(patient)
    }

    async fn find_by_phone_or_id(&self, lookup: &PatientLookup) -> QueueResult<Patient> {
        let patient_id = match lookup {
            PatientLookup::Id(id) => Some(*id),
            PatientLookup::Phone(phone) => match self.phones.get(phone.as_bytes())? {
                Some(raw) => Some(PatientId(uuid_from(&raw)?)),
                None => None,
            },
        };
        let patient = match patient_id {
            Some(id) => Self::get_json::<Patient>(&self.patients, id.0.as_bytes())?,
            None => None,
        };
        patient.ok_or_else(|| QueueError::patient_not_found(lookup))
    }

    async fn append_appointment(&self, appointment: Appointment) -> QueueResult<Appointment> {
        self.ensure_patient(appointment.patient_id)?;
        let key = slot_key(appointment.hospital_id, appointment.visit_day, appointment.token_number);
        (&self.appointments, &self.slots)
            .transaction(|(appointments, slots)| {
                appointments.insert(&appointment.id.0.as_bytes()[..], encode(&appointment)?)?;
                slots.insert(key.as_bytes(), &appointment.id.0.as_bytes()[..])?;
                Ok(())
            })
            .map_err(flatten)?;
        Ok(appointment)
    }

    async fn find_appointment_by_hospital_token_and_day(
        &self,
        hospital_id: HospitalId,
        token_number: u64,
        day: NaiveDate,
    ) -> QueueResult<Option<Appointment>> {
        match self.slots.get(slot_key(hospital_id, day, token_number).as_bytes())? {
            Some(raw) => self.get_appointment(AppointmentId(uuid_from(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update_appointment_status(
        &self,
        patient_id: PatientId,
        appointment_id: AppointmentId,
        status: AppointmentStatus,
    ) -> QueueResult<Appointment> {
        self.ensure_patient(patient_id)?;
        self.appointments
            .transaction(|tx| {
                let mut appointment = load_appointment(tx, appointment_id)?;
                if appointment.patient_id != patient_id {
                    return abort(QueueError::appointment_not_found(appointment_id));
                }
                appointment
                    .transition(status)
                    .map_err(ConflictableTransactionError::Abort)?;
                tx.insert(&appointment_id.0.as_bytes()[..], encode(&appointment)?)?;
                Ok(appointment)
            })
            .map_err(flatten)
    }

    async fn appointments_for_patient(&self, patient_id: PatientId) -> QueueResult<Vec<Appointment>> {
        self.ensure_patient(patient_id)?;
        let mut appointments = Vec::new();
        for entry in self.appointments.iter().values() {
            let appointment: Appointment = serde_json::from_slice(&entry?)?;
            if appointment.patient_id == patient_id {
                appointments.push(appointment);
            }
        }
        appointments.sort_by_key(|apt| (apt.date_of_visit, apt.token_number));
        Ok(appointments)
    }

    async fn appointments_for_day(&self, hospital_id: HospitalId, day: NaiveDate) -> QueueResult<Vec<Appointment>> {
        let mut appointments = Vec::new();
        for entry in self.slots.scan_prefix(day_prefix(hospital_id, day).as_bytes()).values() {
            let appointment_id = AppointmentId(uuid_from(&entry?)?);
            if let Some(appointment) = self.get_appointment(appointment_id)? {
                appointments.push(appointment);
            }
        }
        Ok(appointments)
    }

    async fn delete_appointment(&self, patient_id: PatientId, appointment_id: AppointmentId) -> QueueResult<Appointment> {
        self.ensure_patient(patient_id)?;
        (&self.appointments, &self.slots)
            .transaction(|(appointments, slots)| {
                let appointment = load_appointment(appointments, appointment_id)?;
                if appointment.patient_id != patient_id {
                    return abort(QueueError::appointment_not_found(appointment_id));
                }
                if appointment.status.is_terminal() {
                    return abort(QueueError::InvalidInput(
                        "Cannot delete a completed appointment".to_string(),
                    ));
                }
                appointments.remove(&appointment_id.0.as_bytes()[..])?;
                let key = slot_key(appointment.hospital_id, appointment.visit_day, appointment.token_number);
                if slots.get(key.as_bytes())?.as_deref() == Some(&appointment_id.0.as_bytes()[..]) {
                    slots.remove(key.as_bytes())?;
                }
                Ok(appointment)
            })
            .map_err(flatten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn counters_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hospital = Hospital::new("Lakeside".to_string(), "Ring Road".to_string(), "22".to_string()).unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.insert_hospital(hospital.clone()).await.unwrap();
            assert_eq!(store.increment_issued(hospital.id).await.unwrap(), 1);
            assert_eq!(store.increment_issued(hospital.id).await.unwrap(), 2);
            store.flush().await.unwrap();
        }
        let store = SledStore::open(dir.path()).unwrap();
        let counters = store.counters(hospital.id).await.unwrap();
        assert_eq!(counters, Counters { issued: 3, serving: 1 });
    }

    #[tokio::test]
    async fn phone_index_resolves_patients() {
        let store = SledStore::temporary().unwrap();
        let patient = store
            .insert_patient(Patient::new("Nila".to_string(), "7000".to_string()).unwrap())
            .await
            .unwrap();
        let found = store
            .find_by_phone_or_id(&PatientLookup::Phone("7000".to_string()))
            .await
            .unwrap();
        assert_eq!(found, patient);

        let dup = Patient::new("Other".to_string(), "7000".to_string()).unwrap();
        assert!(matches!(store.insert_patient(dup).await, Err(QueueError::Conflict(_))));
        let missing = store.find_by_phone_or_id(&PatientLookup::Phone("1".to_string())).await;
        assert!(matches!(missing, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn appointment_lifecycle_round_trips() {
        let store = SledStore::temporary().unwrap();
        let hospital = store
            .insert_hospital(Hospital::new("Lakeside".to_string(), "Ring Road".to_string(), "22".to_string()).unwrap())
            .await
            .unwrap();
        let patient = store
            .insert_patient(Patient::new("Nila".to_string(), "7000".to_string()).unwrap())
            .await
            .unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let apt = store
            .append_appointment(Appointment::new(&patient, None, hospital.id, Utc::now(), day, 1).unwrap())
            .await
            .unwrap();

        let found = store
            .find_appointment_by_hospital_token_and_day(hospital.id, 1, day)
            .await
            .unwrap();
        assert_eq!(found.as_ref().map(|a| a.id), Some(apt.id));

        let updated = store
            .update_appointment_status(patient.id, apt.id, AppointmentStatus::Completed)
            .await
            .unwrap();
        assert_eq!(updated.status, AppointmentStatus::Completed);
        assert!(matches!(
            store.delete_appointment(patient.id, apt.id).await,
            Err(QueueError::InvalidInput(_))
        ));
        assert_eq!(store.appointments_for_day(hospital.id, day).await.unwrap().len(), 1);
        assert_eq!(store.appointments_for_patient(patient.id).await.unwrap().len(), 1);
    }
}
