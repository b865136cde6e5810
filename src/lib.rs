//! Segment discovery, analysis, and round-trip encoding for quest script bytecode.
//!
//! Quest scripts are stored as a flat bytecode blob with no section markers. The only structure
//! available is a label table mapping label numbers to byte offsets. This library recovers the
//! layout of such a blob: which ranges are VM instructions, which are raw data, and which are
//! null-terminated strings. It does so by decoding from known entry points, following control
//! flow, and resolving labels that are passed indirectly through registers or the argument stack.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use std::fs;
//! use quest_disasm::{
//!     codec::write_bytecode,
//!     discovery::{parse_bytecode, ParseOptions},
//!     opcode::OpcodeTable,
//! };
//!
//! let bytecode = fs::read("quest.bin").unwrap();
//! let label_offsets: Vec<u32> = vec![0, 24, 96];
//! let entry_labels: BTreeSet<u32> = [0].into_iter().collect();
//!
//! let table = OpcodeTable::standard();
//! let options = ParseOptions::default();
//!
//! let outcome = parse_bytecode(&bytecode, &label_offsets, &entry_labels, &table, &options).unwrap();
//!
//! for problem in &outcome.problems {
//!     println!("{:?}: {}", problem.severity, problem.message);
//! }
//!
//! if let Some(ir) = outcome.value {
//!     // Write the segments back out
//!     let encoded = write_bytecode(&ir, options.width).unwrap();
//!     assert_eq!(encoded.bytecode.len(), bytecode.len());
//! }
//! ```

pub mod opcode;
pub mod segment;
pub mod labels;
pub mod cursor;
pub mod decoder;
pub mod codec;
pub mod analysis;
pub mod discovery;
pub mod format;
pub mod config;

use std::fmt;
use serde::{Deserialize, Serialize};

pub use segment::{Arg, BytecodeIr, Instruction, Segment, SegmentType};
pub use opcode::{Opcode, OpcodeTable};

/// A label number, i.e. an index into the label table.
pub type Label = u32;

/// Label table entry for labels that don't point anywhere.
pub const NO_OFFSET: u32 = u32::MAX;

/// Character width used for string arguments and string segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharWidth {
    /// One byte per character (legacy format)
    Narrow,
    /// UTF-16LE, two bytes per code unit
    #[default]
    Wide,
}

impl CharWidth {
    /// Size in bytes of one code unit
    pub fn unit_size(self) -> usize {
        match self {
            CharWidth::Narrow => 1,
            CharWidth::Wide => 2,
        }
    }
}

impl fmt::Display for CharWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharWidth::Narrow => write!(f, "narrow"),
            CharWidth::Wide => write!(f, "wide"),
        }
    }
}

/// Errors that abort a parse or an encode.
#[derive(Debug, thiserror::Error)]
pub enum BytecodeError {
    /// An instruction couldn't be decoded in strict mode
    #[error("Decode error at offset {offset}: {source}")]
    Decode {
        offset: usize,
        #[source]
        source: decoder::DecodeError,
    },

    /// An opcode declares a parameter type that can't appear at the top level
    #[error("Parameter {index} of {mnemonic} has unsupported type {ty}")]
    UnsupportedParam {
        mnemonic: String,
        index: usize,
        ty: String,
    },

    /// A label doesn't fit into the encoded label width
    #[error("Label value {0} doesn't fit into 16 bits")]
    LabelOutOfRange(i32),

    /// Output formatting error
    #[error("Formatting error: {0}")]
    Format(String),

    /// Generic error
    #[error("Error: {0}")]
    Generic(String),
}

/// How bad a [`Problem`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Trace => write!(f, "trace"),
            Severity::Debug => write!(f, "debug"),
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A diagnostic produced while processing bytecode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub severity: Severity,
    /// Short message suitable for end users
    pub ui_message: String,
    /// Detailed message
    pub message: String,
}

/// The value of an operation together with every problem encountered while producing it.
///
/// A `None` value means the operation failed; `problems` says why.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: Option<T>,
    pub problems: Vec<Problem>,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    /// Problems of at least the given severity
    pub fn problems_at_least(&self, severity: Severity) -> impl Iterator<Item = &Problem> {
        self.problems.iter().filter(move |p| p.severity >= severity)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Problem> {
        self.problems.iter().filter(|p| p.severity == Severity::Warning)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: self.value.map(f),
            problems: self.problems,
        }
    }
}

/// Collects problems and logs each one as it is added.
#[derive(Debug, Default)]
pub struct OutcomeBuilder {
    problems: Vec<Problem>,
}

impl OutcomeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_problem(
        &mut self,
        severity: Severity,
        ui_message: impl Into<String>,
        message: impl Into<String>,
    ) -> &mut Self {
        let problem = Problem {
            severity,
            ui_message: ui_message.into(),
            message: message.into(),
        };

        match severity {
            Severity::Trace => log::trace!("{}", problem.message),
            Severity::Debug => log::debug!("{}", problem.message),
            Severity::Info => log::info!("{}", problem.message),
            Severity::Warning => log::warn!("{}", problem.message),
            Severity::Error => log::error!("{}", problem.message),
        }

        self.problems.push(problem);
        self
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    pub fn success<T>(self, value: T) -> Outcome<T> {
        Outcome {
            value: Some(value),
            problems: self.problems,
        }
    }

    pub fn failure<T>(self) -> Outcome<T> {
        Outcome {
            value: None,
            problems: self.problems,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_width_unit_size() {
        assert_eq!(CharWidth::Narrow.unit_size(), 1);
        assert_eq!(CharWidth::Wide.unit_size(), 2);
        assert_eq!(CharWidth::default(), CharWidth::Wide);
    }

    #[test]
    fn test_outcome_builder_success() {
        let mut builder = OutcomeBuilder::new();
        builder.add_problem(Severity::Warning, "Careful.", "Careful with that.");
        builder.add_problem(Severity::Info, "Note.", "Just a note.");

        let outcome = builder.success(42);
        assert!(outcome.is_success());
        assert_eq!(outcome.value, Some(42));
        assert_eq!(outcome.warnings().count(), 1);
        assert_eq!(outcome.problems_at_least(Severity::Info).count(), 2);
        assert_eq!(outcome.problems_at_least(Severity::Error).count(), 0);
    }

    #[test]
    fn test_outcome_builder_failure() {
        let mut builder = OutcomeBuilder::new();
        builder.add_problem(Severity::Error, "Broken.", "Completely broken.");

        let outcome: Outcome<u8> = builder.failure();
        assert!(!outcome.is_success());
        assert_eq!(outcome.problems[0].severity, Severity::Error);
        assert_eq!(outcome.problems[0].ui_message, "Broken.");
    }

    #[test]
    fn test_outcome_map_keeps_problems() {
        let mut builder = OutcomeBuilder::new();
        builder.add_problem(Severity::Warning, "w", "w");
        let outcome = builder.success(2).map(|v| v * 10);
        assert_eq!(outcome.value, Some(20));
        assert_eq!(outcome.problems.len(), 1);
    }
}
