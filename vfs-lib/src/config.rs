use serde::Deserialize;
use std::path::PathBuf;

/// Storage behaviour shared by every operation of the store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Physical directory every virtual path maps under.
    #[serde(alias = "root_dir", alias = "store_path")]
    pub data_dir: PathBuf,
    /// true: every virtual file owns an independent physical copy.
    /// false: one shared physical copy per content hash.
    #[serde(alias = "save_multiple")]
    pub save_file_multiple: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./file_store_data"),
            save_file_multiple: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults_and_aliases() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.save_file_multiple);

        let config: StoreConfig =
            serde_json::from_str(r#"{"root_dir": "/tmp/x", "save_multiple": true}"#).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
        assert!(config.save_file_multiple);
    }
}
