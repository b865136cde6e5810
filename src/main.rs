use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use rayon::prelude::*;

use quest_disasm::codec::write_bytecode;
use quest_disasm::config::Config;
use quest_disasm::discovery::parse_bytecode;
use quest_disasm::format::OutputFormat;
use quest_disasm::{CharWidth, Label, Severity, NO_OFFSET};

/// Recover the code, data and string layout of quest script bytecode.
#[derive(Debug, Parser)]
#[command(name = "quest_disasm", version)]
struct Cli {
    /// Raw bytecode files
    #[arg(required = true)]
    bytecode: Vec<PathBuf>,

    /// JSON array of label offsets, indexed by label. `null` or -1 marks an absent label
    #[arg(short, long)]
    labels: PathBuf,

    /// Entry labels, decoded as instructions. Defaults to the config file's entry labels
    #[arg(short, long = "entry")]
    entry: Vec<Label>,

    /// Report problems as warnings and keep going
    #[arg(long)]
    lenient: bool,

    /// Use one byte per character for strings
    #[arg(long)]
    legacy: bool,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// TOML file overriding parse options and adding opcodes
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write one output file per input into this directory instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Re-encode the result and check it reproduces the input
    #[arg(long)]
    verify: bool,

    /// -v for info, -vv for debug
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        _ => log::LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_module("quest_disasm", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if cli.lenient {
        config.parse.lenient = true;
    }
    if cli.legacy {
        config.parse.width = CharWidth::Narrow;
    }

    let entry_labels: BTreeSet<Label> = if cli.entry.is_empty() {
        config.entry_labels.iter().copied().collect()
    } else {
        cli.entry.iter().copied().collect()
    };

    let label_offsets = load_label_table(&cli.labels)?;
    let table = config.opcode_table()?;

    if let Some(dir) = &cli.output {
        fs::create_dir_all(dir)
            .with_context(|| format!("Couldn't create output directory {}", dir.display()))?;
    }

    let results: Vec<anyhow::Result<()>> = cli
        .bytecode
        .par_iter()
        .map(|path| {
            let bytecode = fs::read(path)
                .with_context(|| format!("Couldn't read bytecode file {}", path.display()))?;

            let outcome = parse_bytecode(&bytecode, &label_offsets, &entry_labels, &table, &config.parse)
                .with_context(|| format!("Couldn't parse {}", path.display()))?;

            let errors = outcome.problems_at_least(Severity::Error).count();
            let warnings = outcome.warnings().count();
            log::info!(
                "{}: {} errors, {} warnings",
                path.display(),
                errors,
                warnings
            );

            let Some(ir) = outcome.value else {
                let reasons: Vec<&str> = outcome
                    .problems_at_least(Severity::Error)
                    .map(|p| p.message.as_str())
                    .collect();
                bail!("Parsing {} failed: {}", path.display(), reasons.join(" "));
            };

            let width = config.parse.width;

            if cli.verify {
                let encoded = write_bytecode(&ir, width)
                    .with_context(|| format!("Couldn't re-encode {}", path.display()))?;
                if encoded.bytecode != bytecode {
                    bail!("Re-encoding {} didn't reproduce the input", path.display());
                }
            }

            let text = cli.format.get_formatter().format(&ir, width)?;
            write_output(path, cli.output.as_deref(), cli.format, &text)
        })
        .collect();

    let mut failed = 0;
    for result in results {
        if let Err(e) = result {
            eprintln!("Error: {:#}", e);
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} inputs failed", failed, cli.bytecode.len());
    }

    Ok(())
}

/// Reads a JSON label table, e.g. `[0, 24, null, -1, 96]`.
fn load_label_table(path: &Path) -> anyhow::Result<Vec<u32>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Couldn't read label file {}", path.display()))?;
    parse_label_table(&text).with_context(|| format!("Invalid label file {}", path.display()))
}

fn parse_label_table(text: &str) -> anyhow::Result<Vec<u32>> {
    let entries: Vec<Option<i64>> = serde_json::from_str(text)?;

    entries
        .into_iter()
        .enumerate()
        .map(|(label, entry)| match entry {
            None | Some(-1) => Ok(NO_OFFSET),
            Some(offset) => match u32::try_from(offset) {
                Ok(offset) if offset != NO_OFFSET => Ok(offset),
                _ => bail!("Label {} has invalid offset {}", label, offset),
            },
        })
        .collect()
}

fn write_output(
    input: &Path,
    dir: Option<&Path>,
    format: OutputFormat,
    text: &str,
) -> anyhow::Result<()> {
    match dir {
        Some(dir) => {
            let stem = input.file_stem().unwrap_or(input.as_os_str());
            let path = dir.join(stem).with_extension(format.extension());
            fs::write(&path, text).with_context(|| format!("Couldn't write {}", path.display()))
        }
        None => {
            print!("{}", text);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_label_table() {
        let offsets = parse_label_table("[0, 24, null, -1, 96]").unwrap();
        assert_eq!(offsets, vec![0, 24, NO_OFFSET, NO_OFFSET, 96]);
    }

    #[test]
    fn test_parse_label_table_rejects_bad_offsets() {
        assert!(parse_label_table("[0, -5]").is_err());
        assert!(parse_label_table("[0, 99999999999]").is_err());
        assert!(parse_label_table("{\"a\": 1}").is_err());
    }

    #[test]
    fn test_load_label_table_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[12, null]").unwrap();
        assert_eq!(load_label_table(file.path()).unwrap(), vec![12, NO_OFFSET]);
    }

    #[test]
    fn test_write_output_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_output(Path::new("quests/q1.bin"), Some(dir.path()), OutputFormat::Json, "{}").unwrap();

        let written = fs::read_to_string(dir.path().join("q1.json")).unwrap();
        assert_eq!(written, "{}");
    }

    #[test]
    fn test_cli_arguments() {
        let cli = Cli::try_parse_from([
            "quest_disasm", "a.bin", "b.bin", "--labels", "l.json", "-e", "0", "-e", "5", "--legacy",
            "--format", "jsonl", "-vv",
        ])
        .unwrap();

        assert_eq!(cli.bytecode.len(), 2);
        assert_eq!(cli.entry, vec![0, 5]);
        assert!(cli.legacy);
        assert!(!cli.lenient);
        assert_eq!(cli.format, OutputFormat::JsonLines);
        assert_eq!(cli.verbose, 2);
    }
}
