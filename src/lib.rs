//! carequeue: per-hospital patient tokens with a live counter.
//!
//! Each hospital hands out sequential tokens as patients register and
//! advances a live counter as they are called. Both counters go back to 1
//! once a day.

pub mod advancer;
pub mod api;
pub mod config;
pub mod day;
pub mod error;
pub mod issuer;
pub mod models;
pub mod scheduler;
pub mod store;

pub use advancer::{AdvanceOutcome, QueueAdvancer};
pub use api::{router, serve, AppState};
pub use day::DayScope;
pub use error::{QueueError, QueueResult};
pub use issuer::{Registration, RegistrationRequest, TokenIssuer};
pub use scheduler::{DailyJob, DailyResetJob, DailyResetScheduler, DailyTimer, TokioDailyTimer};
pub use store::{CounterStore, HospitalLocks, HospitalRepository, MemoryStore, PatientRepository, QueueStore, SledStore};
