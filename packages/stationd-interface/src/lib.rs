//! High-level API for controlling a driver programming station.
//!
//! The core feature this crate provides is the [`StationInterface`],
//! which exposes the operations an operator can trigger on a station:
//! running a programming cycle, cancelling it, and feeding scans of the
//! units (lamps) that must be checked against the remote service.
//!
//! It also exposes the [`connection`] module, which contains utilities for either
//! delegating these requests to the station daemon or accepting them using
//! your own implementation of [`StationInterface`].

use std::{fmt, future::Future};

use serde::{Deserialize, Serialize};

pub use crate::error::Result;

pub mod connection;
pub mod error;

/// A trait for controlling a programming station.
///
/// The station daemon implements this directly. This crate provides
/// [`StationConnection`](connection::StationConnection), an implementation
/// that delegates every call to the daemon process.
///
/// Methods take `&self` so that a cycle in progress can be cancelled or fed
/// scans from another connection.
pub trait StationInterface {
    fn program(
        &self,
        request: ProgramRequest,
        handle_progress: impl FnMut(ProgramProgress) + Send,
    ) -> impl Future<Output = Result<ProgramOutcome>> + Send;
    fn cancel(&self) -> impl Future<Output = Result> + Send;
    fn scan(&self, raw: String, scanner: String) -> impl Future<Output = Result<ScanOutcome>> + Send;
    fn status(&self) -> impl Future<Output = Result<StationStatus>> + Send;
    fn shutdown(&self) -> impl Future<Output = Result> + Send;
}

/// Order and product metadata a cycle is run for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderContext {
    pub order_no: String,
    /// 12NC of the programmed product.
    pub nc12: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub line: Option<String>,
}

fn default_quantity() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub id: u16,
    pub value: u16,
}

/// The parameter set written to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub name: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRequest {
    pub order: OrderContext,
    pub program: ProgramSpec,
    /// Expected identifiers of the units that must be checked by scan.
    #[serde(default)]
    pub units: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    IssueServiceTag,
    PrepareInput,
    Program,
    ReadOutput,
    Verify,
    Finalize,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::IssueServiceTag => "service tag",
            Phase::PrepareInput => "input file",
            Phase::Program => "programming",
            Phase::ReadOutput => "output file",
            Phase::Verify => "verification",
            Phase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramProgress {
    pub percent: u8,
    pub phase: Phase,
}

/// Phase-qualified failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AlreadyRunning,
    ServiceTagFailure,
    PreparingInputFileFailure,
    ProgrammerFileMissing,
    ProgrammerFailure,
    DeviceFailure,
    OutputFileMissing,
    ReadingOutputFileFailure,
    VerificationFailure,
    VerificationTimeout,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same spelling as on the wire.
        let code = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramOutcome {
    Completed {
        service_tag: String,
        input_hash: String,
        output_hash: String,
    },
    Cancelled,
    Failed {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    Waiting,
    Checking,
    Checked,
    Failed { reason: String },
}

/// A physical item (e.g. a lamp) that must be confirmed by scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub identifier: String,
    pub status: UnitStatus,
    pub scan: Option<String>,
    pub scanner: Option<String>,
}

impl Unit {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            status: UnitStatus::Waiting,
            scan: None,
            scanner: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOutcome {
    /// The unit at this index was confirmed.
    Checked { unit: usize },
    /// The attempt ran but confirmed nothing.
    Failed { reason: String },
    /// The scan was refused without contacting the remote service.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub order: OrderContext,
    pub service_tag: Option<String>,
    pub percent: u8,
    pub phase: Phase,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationStatus {
    pub session: Option<SessionSummary>,
    pub units: Vec<Unit>,
    /// Units are still waiting to be checked.
    pub waiting_for_units: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_screaming_snake_case() {
        assert_eq!(
            ErrorCode::PreparingInputFileFailure.to_string(),
            "PREPARING_INPUT_FILE_FAILURE"
        );
        let code: ErrorCode = serde_json::from_str("\"OUTPUT_FILE_MISSING\"").unwrap();
        assert_eq!(code, ErrorCode::OutputFileMissing);
    }

    #[test]
    fn request_defaults() {
        let request: ProgramRequest = serde_json::from_str(
            r#"{
                "order": { "order_no": "100200300", "nc12": "913700345678" },
                "program": { "name": "350mA", "parameters": [{ "id": 16, "value": 350 }] }
            }"#,
        )
        .unwrap();
        assert_eq!(request.order.quantity, 1);
        assert!(request.units.is_empty());
        assert_eq!(request.program.parameters[0], Parameter { id: 16, value: 350 });
    }
}
