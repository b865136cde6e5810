//! Output formats for parsed bytecode

mod json;
mod csv;

pub use self::json::*;
pub use self::csv::*;

use crate::segment::{DataSegment, StringSegment};
use crate::{BytecodeError, BytecodeIr, CharWidth, Segment, SegmentType};
use std::fmt::{self, Write};
use std::str::FromStr;
use clap::ValueEnum;

/// Supported output formats for parsed bytecode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Assembly-like listing (default)
    #[default]
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one segment per line)
    #[value(name = "jsonl")]
    JsonLines,
    /// CSV format (one row per instruction)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "asm" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// File extension for output files in this format
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Text => "asm",
            OutputFormat::Json => "json",
            OutputFormat::JsonLines => "jsonl",
            OutputFormat::Csv => "csv",
        }
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn IrFormatter + Send + Sync> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for parsed bytecode
pub trait IrFormatter {
    /// Format every segment of `ir`. `width` is needed to compute offsets.
    fn format(&self, ir: &BytecodeIr, width: CharWidth) -> Result<String, BytecodeError>;
}

/// Assembly-like listing
pub struct TextFormatter;

/// Format segments in JSON
pub struct JsonFormatter;

/// Format segments in JSON Lines
pub struct JsonLinesFormatter;

/// Format instructions in CSV
pub struct CsvFormatter;

const DATA_BYTES_PER_LINE: usize = 16;

/// Hex dump of a data segment, space separated
pub(crate) fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn section_marker(ty: SegmentType) -> &'static str {
    match ty {
        SegmentType::Instructions => ".code",
        SegmentType::Data => ".data",
        SegmentType::String => ".string",
    }
}

fn write_data(out: &mut String, segment: &DataSegment) -> fmt::Result {
    for chunk in segment.data.chunks(DATA_BYTES_PER_LINE) {
        let line = chunk
            .iter()
            .map(|b| format!("0x{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(out, "    {}", line)?;
    }
    Ok(())
}

fn write_string(out: &mut String, segment: &StringSegment) -> fmt::Result {
    writeln!(out, "    {:?}", segment.value)
}

impl IrFormatter for TextFormatter {
    fn format(&self, ir: &BytecodeIr, _width: CharWidth) -> Result<String, BytecodeError> {
        let mut out = String::new();
        let mut section = None;

        let fmt_err = |e: fmt::Error| BytecodeError::Format(e.to_string());

        for segment in &ir.segments {
            let ty = segment.segment_type();

            if section != Some(ty) {
                if section.is_some() {
                    out.push('\n');
                }
                writeln!(out, "{}", section_marker(ty)).map_err(fmt_err)?;
                section = Some(ty);
            }

            for label in segment.labels() {
                writeln!(out, "{}:", label).map_err(fmt_err)?;
            }

            match segment {
                Segment::Instructions(s) => {
                    for inst in &s.instructions {
                        if inst.valid {
                            writeln!(out, "    {}", inst).map_err(fmt_err)?;
                        } else {
                            writeln!(out, "    {} ; invalid", inst.opcode.mnemonic).map_err(fmt_err)?;
                        }
                    }
                }
                Segment::Data(s) => write_data(&mut out, s).map_err(fmt_err)?,
                Segment::String(s) => write_string(&mut out, s).map_err(fmt_err)?,
            }
        }

        Ok(out)
    }
}
