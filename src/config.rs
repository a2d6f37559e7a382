// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fspec::{self, OPT_B, OPT_G, OPT_P, OPT_R, OPT_V, OPT_W, OPT_Z};

/// Site configuration for the exec: system identities, default assign
/// mnemonics, and the option letters each mnemonic accepts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub system_qualifier: String,
    pub system_project_id: String,
    pub master_account_id: String,
    pub mass_storage_default_mnemonic: String,
    pub word_addressable_default_mnemonic: String,
    pub tape_default_mnemonic: String,
    /// mnemonic -> letters legal on a catalog image for that mnemonic
    pub mnemonic_options: BTreeMap<String, String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        let mut mnemonic_options = BTreeMap::new();
        mnemonic_options.insert("F".to_string(), "BGPRVWZ".to_string());
        mnemonic_options.insert("D".to_string(), "BGPRVWZ".to_string());
        mnemonic_options.insert("T".to_string(), "GPRWZ".to_string());

        ExecConfig {
            system_qualifier: "SYS$".to_string(),
            system_project_id: "EXEC-8".to_string(),
            master_account_id: "SYSTEM".to_string(),
            mass_storage_default_mnemonic: "F".to_string(),
            word_addressable_default_mnemonic: "D".to_string(),
            tape_default_mnemonic: "T".to_string(),
            mnemonic_options,
        }
    }
}

impl ExecConfig {
    pub fn from_file(path: &Path) -> io::Result<ExecConfig> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn is_mnemonic_configured(&self, mnemonic: &str) -> bool {
        self.mnemonic_options.contains_key(mnemonic)
    }

    /// Option word legal for the mnemonic, or None when it is not configured.
    pub fn allowed_options(&self, mnemonic: &str) -> Option<u32> {
        let letters = self.mnemonic_options.get(mnemonic)?;
        fspec::compose_options(letters).ok()
    }
}

/// The option letters the directory layer itself interprets.
pub fn mfd_consumed_options() -> u32 {
    OPT_B | OPT_G | OPT_P | OPT_R | OPT_V | OPT_W | OPT_Z
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = ExecConfig::default();
        assert_eq!(cfg.system_qualifier, "SYS$");
        assert!(cfg.is_mnemonic_configured("F"));
        assert!(!cfg.is_mnemonic_configured("X"));
        let allowed = cfg.allowed_options("F").unwrap();
        assert_eq!(allowed, mfd_consumed_options());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = ExecConfig::default();
        let text = serde_json::to_string(&cfg).unwrap();
        let back: ExecConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.master_account_id, cfg.master_account_id);
        assert_eq!(back.mnemonic_options, cfg.mnemonic_options);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let back: ExecConfig = serde_json::from_str(r#"{"system_qualifier":"QUAL"}"#).unwrap();
        assert_eq!(back.system_qualifier, "QUAL");
        assert_eq!(back.mass_storage_default_mnemonic, "F");
    }
}
