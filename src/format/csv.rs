//! CSV output formatter

use serde::Serialize;

use crate::{BytecodeError, BytecodeIr, CharWidth, Segment};
use super::{hex_bytes, IrFormatter};

/// One CSV row: an instruction, or a whole data or string segment
#[derive(Serialize)]
struct Row<'a> {
    segment: usize,
    segment_type: &'a str,
    /// Labels of the segment, on its first row only
    labels: String,
    offset: usize,
    size: usize,
    mnemonic: &'a str,
    operands: String,
}

const HEADER: [&str; 7] = ["segment", "segment_type", "labels", "offset", "size", "mnemonic", "operands"];

fn csv_error(e: impl std::fmt::Display) -> BytecodeError {
    BytecodeError::Format(format!("CSV error: {}", e))
}

impl IrFormatter for super::CsvFormatter {
    fn format(&self, ir: &BytecodeIr, width: CharWidth) -> Result<String, BytecodeError> {
        // The header is written by hand so that output without rows still has one
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(HEADER).map_err(csv_error)?;

        for (index, (segment, offset)) in ir.segments.iter().zip(ir.offsets(width)).enumerate() {
            let segment_type = segment.segment_type().to_string();
            let labels = segment
                .labels()
                .iter()
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
                .join(" ");

            match segment {
                Segment::Instructions(s) => {
                    let mut inst_offset = offset;

                    for (i, inst) in s.instructions.iter().enumerate() {
                        let size = inst.byte_size(width);
                        let operands = inst
                            .args
                            .iter()
                            .map(|a| a.to_string())
                            .collect::<Vec<_>>()
                            .join(", ");

                        writer
                            .serialize(Row {
                                segment: index,
                                segment_type: &segment_type,
                                labels: if i == 0 { labels.clone() } else { String::new() },
                                offset: inst_offset,
                                size,
                                mnemonic: &inst.opcode.mnemonic,
                                operands,
                            })
                            .map_err(csv_error)?;

                        inst_offset += size;
                    }
                }
                Segment::Data(s) => {
                    writer
                        .serialize(Row {
                            segment: index,
                            segment_type: &segment_type,
                            labels,
                            offset,
                            size: s.data.len(),
                            mnemonic: "",
                            operands: hex_bytes(&s.data),
                        })
                        .map_err(csv_error)?;
                }
                Segment::String(s) => {
                    writer
                        .serialize(Row {
                            segment: index,
                            segment_type: &segment_type,
                            labels,
                            offset,
                            size: s.byte_size(width),
                            mnemonic: "",
                            operands: s.value.clone(),
                        })
                        .map_err(csv_error)?;
                }
            }
        }

        let bytes = writer.into_inner().map_err(csv_error)?;
        String::from_utf8(bytes).map_err(csv_error)
    }
}
