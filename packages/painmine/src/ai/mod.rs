//! AI clients and call plumbing.

pub mod openai;
pub mod recover;
pub mod retry;

pub use openai::{OpenAiClient, TaskMapping};
pub use recover::{recover_json, slice_array, slice_object};
pub use retry::{with_backoff, Backoff};
