//! TOML configuration file.
//!
//! Every key is optional; missing keys keep their defaults.
//!
//! ```toml
//! entry_labels = [0]
//!
//! [parse]
//! width = "narrow"
//! lenient = true
//! cardinality_bound = 32
//!
//! [parse.thresholds]
//! max_sequential_nops = 16
//!
//! # Added to the standard opcode table, replacing opcodes with the same code
//! [[opcodes]]
//! code = 0xf8a9
//! mnemonic = "set_area_title"
//! params = ["string"]
//! stack = "pop"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::discovery::ParseOptions;
use crate::opcode::{Opcode, OpcodeTable, Param, StackInteraction, TWO_BYTE_PREFIXES};
use crate::Label;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Couldn't read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config syntax: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// An opcode description in the config file. `params` use the notation of [`Param`]'s `FromStr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpcodeEntry {
    pub code: u16,
    pub mnemonic: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub stack: StackInteraction,
}

impl OpcodeEntry {
    fn to_opcode(&self) -> Result<Opcode, ConfigError> {
        let invalid = |reason: String| {
            ConfigError::Invalid(format!("opcode {:#x} ({}): {}", self.code, self.mnemonic, reason))
        };

        let [high, low] = self.code.to_be_bytes();
        let prefixed = TWO_BYTE_PREFIXES.contains(&high);
        if (high != 0 && !prefixed) || (high == 0 && TWO_BYTE_PREFIXES.contains(&low)) {
            return Err(invalid("two-byte codes start with 0xf8 or 0xf9".to_string()));
        }

        let params = self
            .params
            .iter()
            .map(|p| p.parse::<Param>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(e.to_string()))?;

        if let Some(i) = params.iter().position(|p| p.ty.is_variadic()) {
            if i + 1 != params.len() {
                return Err(invalid("only the last parameter can be variadic".to_string()));
            }
        }

        Ok(Opcode::new(self.code, &self.mnemonic, params, self.stack))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub parse: ParseOptions,
    /// Used when no entry label is given on the command line
    pub entry_labels: Vec<Label>,
    /// Opcodes missing from, or differing from, the standard table
    pub opcodes: Vec<OpcodeEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parse: ParseOptions::default(),
            entry_labels: vec![0],
            opcodes: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&text)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The standard opcode table with the configured opcodes added.
    pub fn opcode_table(&self) -> Result<OpcodeTable, ConfigError> {
        let mut table = OpcodeTable::standard();

        for entry in &self.opcodes {
            if table.contains(entry.code) {
                log::debug!("Replacing opcode {:#x} with {}", entry.code, entry.mnemonic);
            }
            table.insert(entry.to_opcode()?);
        }

        if !self.opcodes.is_empty() {
            log::info!("Opcode table has {} opcodes, {} from config", table.len(), self.opcodes.len());
        }

        Ok(table)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.parse.cardinality_bound == 0 {
            return Err(ConfigError::Invalid(
                "cardinality_bound must be at least 1".to_string(),
            ));
        }

        let t = &self.parse.thresholds;
        let ratios = [
            ("max_unknown_opcode_ratio", t.max_unknown_opcode_ratio),
            ("max_stack_pop_without_push_ratio", t.max_stack_pop_without_push_ratio),
            ("max_unknown_label_ratio", t.max_unknown_label_ratio),
        ];

        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be between 0 and 1, got {}",
                    name, value
                )));
            }
        }

        for entry in &self.opcodes {
            entry.to_opcode()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use crate::discovery::classifier::decode_range;
    use crate::opcode::{ParamType, OP_RET};
    use crate::CharWidth;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_override() {
        let config = Config::from_toml(
            r#"
            entry_labels = [0, 5]

            [parse]
            width = "narrow"
            lenient = true

            [parse.thresholds]
            max_sequential_nops = 16
            "#,
        )
        .unwrap();

        assert_eq!(config.entry_labels, vec![0, 5]);
        assert_eq!(config.parse.width, CharWidth::Narrow);
        assert!(config.parse.lenient);
        assert_eq!(config.parse.cardinality_bound, 20);
        assert_eq!(config.parse.thresholds.max_sequential_nops, 16);
        assert_eq!(config.parse.thresholds.max_total_nops, 20);
        assert!(config.parse.builtin_labels.contains(&60));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = Config::from_toml("entry_lables = [1]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_toml("[parse]\ncardinality_bound = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::from_toml("[parse.thresholds]\nmax_unknown_label_ratio = 1.5").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_configured_opcodes() {
        let config = Config::from_toml(
            r#"
            [[opcodes]]
            code = 0x46
            mnemonic = "kill_player"
            params = ["reg", "dword"]

            [[opcodes]]
            code = 0xf8a9
            mnemonic = "set_area_title"
            params = ["string"]
            stack = "pop"
            "#,
        )
        .unwrap();

        let table = config.opcode_table().unwrap();
        assert_eq!(table.len(), OpcodeTable::standard().len() + 2);

        let kill = table.get(0x46);
        assert!(kill.known);
        assert_eq!(kill.params[1].ty, ParamType::DWord);
        assert!(table.get(0xf8a9).pops());

        let bytes = [0x46, 0x03, 0x07, 0x00, 0x00, 0x00, 0x01];
        let insts = decode_range(&bytes, 0, bytes.len(), &table, CharWidth::Wide).unwrap();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[0].opcode.mnemonic, "kill_player");
        assert_eq!(insts[1].opcode.code, OP_RET);

        assert!(!OpcodeTable::standard().get(0x46).known);
    }

    #[test]
    fn test_configured_opcode_replaces_standard() {
        let config = Config::from_toml(
            "[[opcodes]]\ncode = 0x01\nmnemonic = \"exit\"",
        )
        .unwrap();
        assert_eq!(config.opcode_table().unwrap().get(OP_RET).mnemonic, "exit");
    }

    #[test]
    fn test_invalid_opcodes() {
        let cases = [
            "[[opcodes]]\ncode = 0x1234\nmnemonic = \"x\"",
            "[[opcodes]]\ncode = 0xf8\nmnemonic = \"x\"",
            "[[opcodes]]\ncode = 0x46\nmnemonic = \"x\"\nparams = [\"qword\"]",
            "[[opcodes]]\ncode = 0x46\nmnemonic = \"x\"\nparams = [\"byte...\", \"byte\"]",
        ];

        for case in cases {
            let err = Config::from_toml(case).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{}", case);
        }

        let err = Config::from_toml("[[opcodes]]\ncode = 0x46\nmnemonic = \"x\"\nstack = \"both\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[parse]\ncardinality_bound = 8").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.parse.cardinality_bound, 8);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
