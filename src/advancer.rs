/// Calling the next patient.
///
/// Advancing moves the serving counter one step, completes the
/// appointment whose token was just vacated and looks up whoever now holds
/// the counter. Both lookups are scoped to today in the queue's zone.

use crate::day::DayScope;
use crate::error::QueueResult;
use crate::models::{AppointmentStatus, HospitalId, PatientSummary};
use crate::store::{HospitalLocks, HospitalRepository, PatientRepository};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the live counter display shows after an advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceOutcome {
    pub live_counter: u64,
    /// False when nobody was waiting and the counter stayed put.
    pub advanced: bool,
    /// The patient whose token was just completed.
    pub current_patient: Option<PatientSummary>,
    /// The patient now at the counter.
    pub next_patient: Option<PatientSummary>,
}

pub struct QueueAdvancer<H: ?Sized, P: ?Sized> {
    hospitals: Arc<H>,
    patients: Arc<P>,
    locks: HospitalLocks,
    scope: DayScope,
}

impl<H, P> QueueAdvancer<H, P>
where
    H: HospitalRepository + ?Sized,
    P: PatientRepository + ?Sized,
{
    pub fn new(hospitals: Arc<H>, patients: Arc<P>, locks: HospitalLocks, scope: DayScope) -> Self {
        QueueAdvancer {
            hospitals,
            patients,
            locks,
            scope,
        }
    }

    pub async fn advance(&self, hospital_id: HospitalId) -> QueueResult<AdvanceOutcome> {
        self.advance_on(hospital_id, self.scope.today()).await
    }

    /// Advance using `today` as the day scope for appointment lookups.
    ///
    /// Unknown hospitals fail with `NotFound` before a lock is created.
    pub async fn advance_on(&self, hospital_id: HospitalId, today: NaiveDate) -> QueueResult<AdvanceOutcome> {
        self.hospitals.find_hospital(hospital_id).await?;
        let _calling = self.locks.lock(hospital_id).await;
        let step = self.hospitals.increment_serving(hospital_id).await?;

        let current_patient = if step.advanced {
            self.complete(hospital_id, step.serving - 1, today).await?
        } else {
            debug!(%hospital_id, serving = step.serving, "queue exhausted, counter unchanged");
            None
        };

        let next_patient = self
            .patients
            .find_appointment_by_hospital_token_and_day(hospital_id, step.serving, today)
            .await?
            .map(|appointment| appointment.summary());

        if step.advanced {
            info!(%hospital_id, live_counter = step.serving, "live counter advanced");
        }

        Ok(AdvanceOutcome {
            live_counter: step.serving,
            advanced: step.advanced,
            current_patient,
            next_patient,
        })
    }

    /// Mark the appointment holding `token` as completed, if there is one.
    async fn complete(
        &self,
        hospital_id: HospitalId,
        token: u64,
        today: NaiveDate,
    ) -> QueueResult<Option<PatientSummary>> {
        let Some(appointment) = self
            .patients
            .find_appointment_by_hospital_token_and_day(hospital_id, token, today)
            .await?
        else {
            debug!(%hospital_id, token, "no appointment for served token");
            return Ok(None);
        };

        if appointment.status != AppointmentStatus::Completed {
            // The counter has already moved; a failed status write is logged, not surfaced.
            if let Err(err) = self
                .patients
                .update_appointment_status(appointment.patient_id, appointment.id, AppointmentStatus::Completed)
                .await
            {
                warn!(%hospital_id, token, error = %err, "failed to complete served appointment");
            }
        }
        Ok(Some(appointment.summary()))
    }

    /// Token currently at the counter.
    pub async fn live_counter(&self, hospital_id: HospitalId) -> QueueResult<u64> {
        Ok(self.hospitals.counters(hospital_id).await?.serving)
    }
}
