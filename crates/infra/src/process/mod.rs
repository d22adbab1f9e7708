//! Registration process manager: coordinates the order and availability
//! aggregates through the reservation and payment workflow.

pub mod postgres;
pub mod registration;
pub mod router;
pub mod store;

pub use postgres::PostgresProcessStore;
pub use registration::{
    ExpireRegistrationProcess, ProcessError, RegistrationProcess, RegistrationProcessState,
};
pub use router::RegistrationProcessRouter;
pub use store::{InMemoryProcessStore, ProcessStore, ProcessStoreError};
