use std::env;

use config::{Config, File};
use serde::Deserialize;

/// Engine configuration.
///
/// The long-running loops hold this behind an `Arc` and read the gas
/// settings every round, so the owning process can swap the configuration
/// at runtime without restarting the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub database_url: String,
    pub rpc_url: String,
    pub chain_id: u64,

    /// Master switch. When false the broadcaster does not start; the
    /// confirmer still runs so previously broadcast transactions keep
    /// getting confirmed.
    #[serde(default = "default_enable_tx_engine")]
    pub enable_tx_engine: bool,

    #[serde(default)]
    pub gas: GasConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasConfig {
    /// Gas price for a first attempt, and the floor every bump is clamped
    /// to.
    pub price_default: u128,

    /// Multiplicative bump component, in percent of the previous price.
    pub bump_percent: u32,

    /// Additive bump component, in wei.
    pub bump_wei: u128,

    /// Absolute ceiling. Once a transaction's attempts reach this price
    /// the engine stops overpaying and waits for inclusion.
    pub max_price_wei: u128,

    /// Heads of un-inclusion before an unconfirmed attempt is re-sent at a
    /// higher price.
    pub bump_threshold: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            price_default: 20_000_000_000,        // 20 gwei
            bump_percent: 20,
            bump_wei: 5_000_000_000,              // 5 gwei
            max_price_wei: 1_500_000_000_000,     // 1500 gwei
            bump_threshold: 3,
        }
    }
}

fn default_enable_tx_engine() -> bool {
    true
}

impl EngineConfig {
    /// Load configuration from `configuration/engine.yaml` under the
    /// current directory (when present) layered with `TXENGINE__`-prefixed
    /// environment variables, e.g. `TXENGINE__GAS__BUMP_PERCENT=50`.
    pub fn load() -> Result<Self, config::ConfigError> {
        let base_path = env::current_dir()
            .map_err(|e| config::ConfigError::Message(format!("cannot determine cwd: {e}")))?;
        let configuration_directory = base_path.join("configuration");

        Config::builder()
            .add_source(File::from(configuration_directory.join("engine.yaml")).required(false))
            .add_source(config::Environment::with_prefix("txengine").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_defaults() {
        let gas = GasConfig::default();
        assert_eq!(gas.price_default, 20_000_000_000);
        assert_eq!(gas.bump_percent, 20);
        assert_eq!(gas.bump_wei, 5_000_000_000);
        assert_eq!(gas.bump_threshold, 3);
        assert!(gas.max_price_wei > gas.price_default);
    }

    #[test]
    fn deserializes_with_partial_gas_section() {
        let config: EngineConfig = Config::builder()
            .add_source(config::File::from_str(
                r#"
                database_url: "postgres://localhost/txengine"
                rpc_url: "http://localhost:8545"
                chain_id: 3
                gas:
                  bump_percent: 50
                "#,
                config::FileFormat::Yaml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert!(config.enable_tx_engine);
        assert_eq!(config.gas.bump_percent, 50);
        // Untouched fields keep their defaults.
        assert_eq!(config.gas.bump_threshold, 3);
    }
}
