//! Filter-based processing of downstream Guacamole instructions.
//!
//! Filters run in the downstream pump (guacd → browser) against each parsed
//! instruction before its raw frame is forwarded. A filter may pass the
//! instruction, drop it silently, or deny it with an error that terminates
//! the session. The default chain is empty, so all in-band traffic
//! (including guacd `error` instructions) flows to the browser verbatim.

use guacgate_protocol::Instruction;

use crate::error::{GatewayError, Result};

/// What to do with a filtered instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Forward the instruction unchanged.
    Pass,
    /// Silently drop the instruction.
    Drop,
}

/// A filter applied to each downstream instruction.
pub trait InstructionFilter: Send + Sync {
    /// Decide the fate of one instruction. Returning an error denies it and
    /// terminates the session with the error's close code.
    fn filter(&self, instruction: &Instruction) -> Result<FilterDecision>;
}

/// guacd status categories, as carried by `error,<msg>,<code>;`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStatus {
    Unsupported,
    ServerBusy,
    UpstreamTimeout,
    UpstreamError,
    ResourceNotFound,
    ResourceConflict,
    SessionConflict,
    SessionTimeout,
    SessionClosed,
    ClientBadRequest,
    ClientUnauthorized,
    ClientTooMany,
}

impl UpstreamStatus {
    /// Map a numeric guacd status code to its category.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0100 => Some(UpstreamStatus::Unsupported),
            0x0201 => Some(UpstreamStatus::ServerBusy),
            0x0202 => Some(UpstreamStatus::UpstreamTimeout),
            0x0203 => Some(UpstreamStatus::UpstreamError),
            0x0204 => Some(UpstreamStatus::ResourceNotFound),
            0x0205 => Some(UpstreamStatus::ResourceConflict),
            0x0209 => Some(UpstreamStatus::SessionConflict),
            0x020A => Some(UpstreamStatus::SessionTimeout),
            0x020B => Some(UpstreamStatus::SessionClosed),
            0x0300 => Some(UpstreamStatus::ClientBadRequest),
            0x0301 | 0x0303 => Some(UpstreamStatus::ClientUnauthorized),
            0x031D => Some(UpstreamStatus::ClientTooMany),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamStatus::Unsupported => "unsupported",
            UpstreamStatus::ServerBusy => "server busy",
            UpstreamStatus::UpstreamTimeout => "upstream timeout",
            UpstreamStatus::UpstreamError => "upstream error",
            UpstreamStatus::ResourceNotFound => "resource not found",
            UpstreamStatus::ResourceConflict => "resource conflict",
            UpstreamStatus::SessionConflict => "session conflict",
            UpstreamStatus::SessionTimeout => "session timeout",
            UpstreamStatus::SessionClosed => "session closed",
            UpstreamStatus::ClientBadRequest => "client bad request",
            UpstreamStatus::ClientUnauthorized => "client unauthorized",
            UpstreamStatus::ClientTooMany => "client too many",
        }
    }
}

/// Denies guacd `error` instructions, classifying the status code and
/// terminating the session instead of relaying the error to the browser.
///
/// Not installed by default: the relay contract forwards in-band errors
/// verbatim. Operators that want server-side classification opt in.
pub struct ErrorFilter;

impl InstructionFilter for ErrorFilter {
    fn filter(&self, instruction: &Instruction) -> Result<FilterDecision> {
        if instruction.opcode != "error" {
            return Ok(FilterDecision::Pass);
        }

        let message = instruction
            .args
            .first()
            .map(String::as_str)
            .unwrap_or("Unknown guacd error")
            .to_string();
        let code = instruction
            .args
            .get(1)
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(0);

        match UpstreamStatus::from_code(code) {
            Some(status) => Err(GatewayError::UpstreamRejected {
                code,
                message: format!("{} ({})", message, status.as_str()),
            }),
            None => Err(GatewayError::Protocol(format!(
                "guacd error: {message} (code {code})"
            ))),
        }
    }
}

/// Run an instruction through a filter chain, first decision short-circuits
/// on `Drop` and errors propagate.
pub fn apply_filters(
    filters: &[Box<dyn InstructionFilter>],
    instruction: &Instruction,
) -> Result<FilterDecision> {
    for filter in filters {
        if filter.filter(instruction)? == FilterDecision::Drop {
            return Ok(FilterDecision::Drop);
        }
    }
    Ok(FilterDecision::Pass)
}
