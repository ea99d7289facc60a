/// Token issuance for newly registered appointments.
///
/// The issuer takes the hospital's issuance lock, allocates a token from
/// the counter store and appends the appointment. If the append fails the
/// token is released again, so the counter and the appointment list never
/// disagree.

use crate::day::DayScope;
use crate::error::QueueResult;
use crate::models::{Appointment, HospitalId, Patient, PatientLookup};
use crate::store::{HospitalLocks, HospitalRepository, PatientRepository};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A patient's request for a token.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub patient: PatientLookup,
    /// Name to show on the queue display; defaults to the patient's name.
    pub patient_name: Option<String>,
}

impl RegistrationRequest {
    pub fn new(patient: PatientLookup) -> Self {
        RegistrationRequest {
            patient,
            patient_name: None,
        }
    }
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub patient: Patient,
    pub appointment: Appointment,
}

impl Registration {
    pub fn token(&self) -> u64 {
        self.appointment.token_number
    }
}

pub struct TokenIssuer<H: ?Sized, P: ?Sized> {
    hospitals: Arc<H>,
    patients: Arc<P>,
    locks: HospitalLocks,
    scope: DayScope,
}

impl<H, P> TokenIssuer<H, P>
where
    H: HospitalRepository + ?Sized,
    P: PatientRepository + ?Sized,
{
    pub fn new(hospitals: Arc<H>, patients: Arc<P>, locks: HospitalLocks, scope: DayScope) -> Self {
        TokenIssuer {
            hospitals,
            patients,
            locks,
            scope,
        }
    }

    /// Register a new appointment at `hospital_id` and hand it the next token.
    ///
    /// Unknown hospitals and patients fail with `NotFound` before the
    /// counter is touched. The visit is always dated now.
    pub async fn register(
        &self,
        hospital_id: HospitalId,
        request: RegistrationRequest,
    ) -> QueueResult<Registration> {
        self.register_with_clock(hospital_id, request, Utc::now).await
    }

    async fn register_with_clock<F>(
        &self,
        hospital_id: HospitalId,
        request: RegistrationRequest,
        clock: F,
    ) -> QueueResult<Registration>
    where
        F: Fn() -> DateTime<Utc>,
    {
        self.hospitals.find_hospital(hospital_id).await?;
        let patient = self.patients.find_by_phone_or_id(&request.patient).await?;

        let _issuing = self.locks.lock(hospital_id).await;
        // Read the clock under the lock so the visit day matches the counter.
        let date_of_visit = clock();
        let visit_day = self.scope.day_of(date_of_visit);
        let token = self.hospitals.increment_issued(hospital_id).await?;
        debug!(%hospital_id, token, "token allocated");

        let stored = match Appointment::new(
            &patient,
            request.patient_name,
            hospital_id,
            date_of_visit,
            visit_day,
            token,
        ) {
            Ok(appointment) => self.patients.append_appointment(appointment).await,
            Err(err) => Err(err),
        };

        match stored {
            Ok(appointment) => {
                info!(%hospital_id, patient_id = %patient.id, token, "token issued");
                Ok(Registration { patient, appointment })
            }
            Err(err) => {
                match self.hospitals.release_issued(hospital_id, token).await {
                    Ok(true) => warn!(%hospital_id, token, error = %err, "registration failed, token released"),
                    Ok(false) => warn!(%hospital_id, token, error = %err, "registration failed, token could not be released"),
                    Err(release_err) => warn!(
                        %hospital_id,
                        token,
                        error = %err,
                        release_error = %release_err,
                        "registration failed and token release errored"
                    ),
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::models::{AppointmentId, AppointmentStatus, Counters, Hospital, PatientId};
    use crate::store::{CounterStore, MemoryStore, SledStore};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Delegates to another store but refuses to store appointments.
    struct BrokenAppointments<S>(Arc<S>);

    #[async_trait]
    impl<S: PatientRepository> PatientRepository for BrokenAppointments<S> {
        async fn insert_patient(&self, patient: Patient) -> QueueResult<Patient> {
            self.0.insert_patient(patient).await
        }

        async fn find_by_phone_or_id(&self, lookup: &PatientLookup) -> QueueResult<Patient> {
            self.0.find_by_phone_or_id(lookup).await
        }

        async fn append_appointment(&self, _appointment: Appointment) -> QueueResult<Appointment> {
            Err(QueueError::Internal("disk full".to_string()))
        }

        async fn find_appointment_by_hospital_token_and_day(
            &self,
            hospital_id: HospitalId,
            token_number: u64,
            day: NaiveDate,
        ) -> QueueResult<Option<Appointment>> {
            self.0
                .find_appointment_by_hospital_token_and_day(hospital_id, token_number, day)
                .await
        }

        async fn update_appointment_status(
            &self,
            patient_id: PatientId,
            appointment_id: AppointmentId,
            status: AppointmentStatus,
        ) -> QueueResult<Appointment> {
            self.0.update_appointment_status(patient_id, appointment_id, status).await
        }

        async fn appointments_for_patient(&self, patient_id: PatientId) -> QueueResult<Vec<Appointment>> {
            self.0.appointments_for_patient(patient_id).await
        }

        async fn appointments_for_day(&self, hospital_id: HospitalId, day: NaiveDate) -> QueueResult<Vec<Appointment>> {
            self.0.appointments_for_day(hospital_id, day).await
        }

        async fn delete_appointment(&self, patient_id: PatientId, appointment_id: AppointmentId) -> QueueResult<Appointment> {
            self.0.delete_appointment(patient_id, appointment_id).await
        }
    }

    async fn seed<S: HospitalRepository + PatientRepository>(store: &S) -> (Hospital, Patient) {
        let hospital = store
            .insert_hospital(Hospital::new("Apollo".to_string(), "Bannerghatta".to_string(), "1860".to_string()).unwrap())
            .await
            .unwrap();
        let patient = store
            .insert_patient(Patient::new("Kiran".to_string(), "9000000001".to_string()).unwrap())
            .await
            .unwrap();
        (hospital, patient)
    }

    async fn seeded() -> (Arc<MemoryStore>, Hospital, Patient) {
        let store = Arc::new(MemoryStore::new());
        let (hospital, patient) = seed(store.as_ref()).await;
        (store, hospital, patient)
    }

    #[tokio::test]
    async fn tokens_follow_the_counter() {
        let (store, hospital, patient) = seeded().await;
        let issuer = TokenIssuer::new(store.clone(), store.clone(), HospitalLocks::new(), DayScope::kolkata());

        for expected in 1..=3 {
            let registration = issuer
                .register(hospital.id, RegistrationRequest::new(PatientLookup::Phone(patient.phone.clone())))
                .await
                .unwrap();
            assert_eq!(registration.token(), expected);
            assert_eq!(registration.appointment.status, AppointmentStatus::Waiting);
            assert_eq!(registration.appointment.visit_day, DayScope::kolkata().today());
        }
        assert_eq!(store.counters(hospital.id).await.unwrap().issued, 4);
    }

    #[tokio::test]
    async fn unknown_hospital_leaves_counters_alone() {
        let (store, hospital, patient) = seeded().await;
        let locks = HospitalLocks::new();
        let issuer = TokenIssuer::new(store.clone(), store.clone(), locks.clone(), DayScope::kolkata());

        let err = issuer
            .register(HospitalId::new(), RegistrationRequest::new(PatientLookup::Id(patient.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
        assert_eq!(locks.tracked(), 0);

        let err = issuer
            .register(hospital.id, RegistrationRequest::new(PatientLookup::Phone("000".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
        assert_eq!(store.counters(hospital.id).await.unwrap(), Counters::START);
    }

    async fn failed_append_rolls_back<S: HospitalRepository + PatientRepository + 'static>(store: Arc<S>) {
        let (hospital, patient) = seed(store.as_ref()).await;
        let broken = Arc::new(BrokenAppointments(store.clone()));
        let issuer = TokenIssuer::new(store.clone(), broken, HospitalLocks::new(), DayScope::kolkata());

        let err = issuer
            .register(hospital.id, RegistrationRequest::new(PatientLookup::Id(patient.id)))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Internal(_)));
        assert_eq!(store.counters(hospital.id).await.unwrap(), Counters::START);
    }

    #[tokio::test]
    async fn failed_append_rolls_the_counter_back() {
        failed_append_rolls_back(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn failed_append_rolls_the_sled_counter_back() {
        failed_append_rolls_back(Arc::new(SledStore::temporary().unwrap())).await;
    }

    #[tokio::test]
    async fn visit_day_uses_the_fixed_zone() {
        let (store, hospital, patient) = seeded().await;
        let issuer = TokenIssuer::new(store.clone(), store.clone(), HospitalLocks::new(), DayScope::kolkata());
        let late_evening_utc = chrono::TimeZone::with_ymd_and_hms(&Utc, 2024, 8, 14, 19, 0, 0).unwrap();

        let mut request = RegistrationRequest::new(PatientLookup::Id(patient.id));
        request.patient_name = Some("Kiran (child)".to_string());
        let registration = issuer
            .register_with_clock(hospital.id, request, || late_evening_utc)
            .await
            .unwrap();

        assert_eq!(registration.appointment.date_of_visit, late_evening_utc);
        assert_eq!(registration.appointment.visit_day, NaiveDate::from_ymd_opt(2024, 8, 15).unwrap());
        assert_eq!(registration.appointment.patient_name, "Kiran (child)");
    }

    #[tokio::test]
    async fn visit_time_is_read_after_the_lock() {
        let (store, hospital, patient) = seeded().await;
        let locks = HospitalLocks::new();
        let issuer = Arc::new(TokenIssuer::new(store.clone(), store.clone(), locks.clone(), DayScope::kolkata()));
        let clock_read = Arc::new(AtomicBool::new(false));

        let held = locks.lock(hospital.id).await;
        let task = {
            let issuer = issuer.clone();
            let clock_read = clock_read.clone();
            tokio::spawn(async move {
                issuer
                    .register_with_clock(hospital.id, RegistrationRequest::new(PatientLookup::Id(patient.id)), || {
                        clock_read.store(true, Ordering::SeqCst);
                        Utc::now()
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!clock_read.load(Ordering::SeqCst));
        drop(held);

        let registration = task.await.unwrap().unwrap();
        assert!(clock_read.load(Ordering::SeqCst));
        assert_eq!(registration.token(), 1);
    }
}
