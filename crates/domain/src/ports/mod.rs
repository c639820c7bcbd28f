use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod apply_runs;
pub mod collaborators;
pub mod db;
pub mod drafts;
pub mod jobs;
pub mod quota;
pub mod triggers;
