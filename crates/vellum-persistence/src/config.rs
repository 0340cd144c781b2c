use serde::{Deserialize, Serialize};
use vellum_store::CodecConfig;

use crate::error::{PersistenceError, PersistenceResult};

/// Whether bulk enumeration reads the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// `load_all` and `reload` read every key from the store.
    #[default]
    Eager,
    /// `load_all` and `reload` return nothing; keys are loaded one at a
    /// time on demand.
    Lazy,
}

/// Configuration of a [`Persistence`](crate::Persistence) engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub load_strategy: LoadStrategy,
    pub codec: CodecConfig,
}

impl PersistenceConfig {
    /// Default configuration with lazy loading.
    pub fn lazy() -> Self {
        Self {
            load_strategy: LoadStrategy::Lazy,
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> PersistenceResult<Self> {
        toml::from_str(s).map_err(|e| PersistenceError::Config(e.to_string()))
    }
}
