pub mod get_job;
pub mod stream_progress;
