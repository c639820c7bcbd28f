pub mod apply;
pub mod auth;
pub mod automations;
pub mod drafts;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod generation;
pub mod identity;
pub mod jobs;
pub mod ports;
pub mod quota;
pub mod triggers;
pub mod util;
pub mod work_queue;

pub type DomainResult<T> = Result<T, error::DomainError>;
