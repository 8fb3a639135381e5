use super::BrokerConfig;
use crate::Result;
use config::{Config, Environment};

impl BrokerConfig {
    /// Load configuration from `EMBERMQ_`-prefixed environment variables,
    /// e.g. `EMBERMQ_PORT=5673`.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Config::try_from(&BrokerConfig::default()).map_err(|e| {
                crate::BrokerError::Config(e.to_string())
            })?)
            .add_source(Environment::with_prefix("EMBERMQ"))
            .build()
            .map_err(|e| crate::BrokerError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| crate::BrokerError::Config(e.to_string()))?;

        Ok(config)
    }
}
