//! Pure SOVD command validation.
//!
//! `validate` is a deterministic function over `(command_name, params)` — no
//! I/O, no clock, no state. The supported command set is closed at build
//! time; an unknown name is a validation error, not a lookup failure.
//!
//! The typed view (`DiagnosticCommand`) is the primary API: parsing either
//! yields a well-formed command or the first offending field. `validate` is
//! parse-and-discard for callers that only need the verdict.

use serde_json::Value;

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// What kind of check failed. Drives the REST error code selection
/// (unknown command / missing field / bad format).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    UnknownCommand,
    MissingField,
    BadFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The offending field, or `command_name` for unknown commands.
    pub field: String,
    pub reason: String,
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    fn unknown_command(name: &str) -> Self {
        Self {
            field: "command_name".to_string(),
            reason: format!("unsupported command: {name}"),
            kind: ValidationErrorKind::UnknownCommand,
        }
    }

    fn missing(field: &str) -> Self {
        Self {
            field: field.to_string(),
            reason: format!("required parameter {field} is missing"),
            kind: ValidationErrorKind::MissingField,
        }
    }

    fn bad_format(field: &str, expected: &str) -> Self {
        Self {
            field: field.to_string(),
            reason: format!("{field} must match {expected}"),
            kind: ValidationErrorKind::BadFormat,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// DiagnosticCommand — tagged-union view of the closed command set
// ---------------------------------------------------------------------------

/// A validated SOVD command. Storage and transport keep the original opaque
/// `command_params` mapping; this view exists only at the validation seam.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticCommand {
    ReadDtc {
        ecu_address: String,
    },
    ClearDtc {
        ecu_address: String,
        dtc_code: Option<String>,
    },
    ReadDataById {
        ecu_address: String,
        data_id: String,
    },
}

impl DiagnosticCommand {
    /// Parse and validate `(command_name, params)`.
    ///
    /// Params must be a JSON object with string values for the checked
    /// fields. Fields beyond the required set are ignored (the stored
    /// `command_params` remains whatever the caller sent).
    pub fn parse(name: &str, params: &Value) -> Result<Self, ValidationError> {
        match name {
            "ReadDTC" => {
                let ecu_address = required_str(params, "ecuAddress")?;
                check_ecu_address(&ecu_address)?;
                Ok(DiagnosticCommand::ReadDtc { ecu_address })
            }
            "ClearDTC" => {
                let ecu_address = required_str(params, "ecuAddress")?;
                check_ecu_address(&ecu_address)?;
                let dtc_code = optional_str(params, "dtcCode")?;
                if let Some(code) = &dtc_code {
                    check_dtc_code(code)?;
                }
                Ok(DiagnosticCommand::ClearDtc {
                    ecu_address,
                    dtc_code,
                })
            }
            "ReadDataByID" => {
                let ecu_address = required_str(params, "ecuAddress")?;
                check_ecu_address(&ecu_address)?;
                let data_id = required_str(params, "dataId")?;
                check_data_id(&data_id)?;
                Ok(DiagnosticCommand::ReadDataById {
                    ecu_address,
                    data_id,
                })
            }
            other => Err(ValidationError::unknown_command(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticCommand::ReadDtc { .. } => "ReadDTC",
            DiagnosticCommand::ClearDtc { .. } => "ClearDTC",
            DiagnosticCommand::ReadDataById { .. } => "ReadDataByID",
        }
    }
}

/// Verdict-only form of [`DiagnosticCommand::parse`].
pub fn validate(name: &str, params: &Value) -> Result<(), ValidationError> {
    DiagnosticCommand::parse(name, params).map(|_| ())
}

// ---------------------------------------------------------------------------
// Field extraction
// ---------------------------------------------------------------------------

fn required_str(params: &Value, field: &str) -> Result<String, ValidationError> {
    match params {
        Value::Object(map) => match map.get(field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(_) => Err(ValidationError::bad_format(field, "a string value")),
            None => Err(ValidationError::missing(field)),
        },
        // A non-object params mapping can never carry the required field.
        _ => Err(ValidationError::missing(field)),
    }
}

fn optional_str(params: &Value, field: &str) -> Result<Option<String>, ValidationError> {
    match params {
        Value::Object(map) => match map.get(field) {
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Null) | None => Ok(None),
            Some(_) => Err(ValidationError::bad_format(field, "a string value")),
        },
        _ => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Format checks
// ---------------------------------------------------------------------------

fn is_hex_digits(s: &str, n: usize) -> bool {
    s.len() == n && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// `0x` + 2 hex digits, e.g. `0x10`.
fn check_ecu_address(s: &str) -> Result<(), ValidationError> {
    match s.strip_prefix("0x") {
        Some(rest) if is_hex_digits(rest, 2) => Ok(()),
        _ => Err(ValidationError::bad_format(
            "ecuAddress",
            "0x followed by 2 hex digits",
        )),
    }
}

/// `P` + 4 hex digits, e.g. `P0420`.
fn check_dtc_code(s: &str) -> Result<(), ValidationError> {
    match s.strip_prefix('P') {
        Some(rest) if is_hex_digits(rest, 4) => Ok(()),
        _ => Err(ValidationError::bad_format(
            "dtcCode",
            "P followed by 4 hex digits",
        )),
    }
}

/// `0x` + 4 hex digits, e.g. `0xF190`.
fn check_data_id(s: &str) -> Result<(), ValidationError> {
    match s.strip_prefix("0x") {
        Some(rest) if is_hex_digits(rest, 4) => Ok(()),
        _ => Err(ValidationError::bad_format(
            "dataId",
            "0x followed by 4 hex digits",
        )),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
