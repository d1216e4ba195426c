use serde::{Deserialize, Serialize};

use crate::{ProgramOutcome, ProgramProgress, ProgramRequest, error::RemoteError};

pub type CompletionResponse<T = ()> = Result<T, RemoteError>;

#[derive(Debug, Serialize, Deserialize)]
pub enum StationCommand {
    Program(ProgramRequest),
    Cancel,
    Scan { raw: String, scanner: String },
    Status,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ProgressResponse {
    Progress(ProgramProgress),
    Complete(CompletionResponse<ProgramOutcome>),
}
