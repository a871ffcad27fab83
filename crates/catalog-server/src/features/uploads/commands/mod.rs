pub mod complete;
pub mod initiate;
pub mod upload;

pub use complete::{CompleteUploadCommand, CompleteUploadError};
pub use initiate::{InitiateUploadCommand, InitiateUploadError, InitiateUploadResponse};
pub use upload::{UploadAccepted, UploadCsvCommand, UploadError};
