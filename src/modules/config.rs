use std::env;
use std::time::Duration;
use url::Url;

use crate::modules::errors::ConfigError;
use crate::modules::exchange::ExchangeFamily;
use crate::modules::types::SymbolInfo;

// -------------------- Engine Configuration --------------------
// Read once at startup into a fully typed record; nothing downstream touches
// the environment again.

const DEFAULT_MONGO_URI: &str = "mongodb://localhost:27017";
const DEFAULT_MONGO_DB: &str = "gcb_bots";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub mongo_uri: String,
    pub mongo_db: String,
    pub exchange_family: ExchangeFamily,
    pub exchange_base_url: Url,
    pub http_timeout: Duration,
    /// Per-symbol fallback when exchange metadata is unavailable
    pub fallback_precision: SymbolInfo,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mongo_uri =
            env::var("MONGODB_URI").unwrap_or_else(|_| DEFAULT_MONGO_URI.to_string());
        let mongo_db = env::var("MONGODB_DB").unwrap_or_else(|_| DEFAULT_MONGO_DB.to_string());

        let exchange_family: ExchangeFamily = env::var("EXCHANGE_FAMILY")
            .unwrap_or_else(|_| "ch".to_string())
            .parse()
            .map_err(|reason| ConfigError::Invalid {
                name: "EXCHANGE_FAMILY",
                reason,
            })?;

        let base_url = env::var("EXCHANGE_BASE_URL")
            .map_err(|_| ConfigError::MissingVar("EXCHANGE_BASE_URL"))?;
        let exchange_base_url = Url::parse(&base_url).map_err(|e| ConfigError::Invalid {
            name: "EXCHANGE_BASE_URL",
            reason: e.to_string(),
        })?;

        let http_timeout = Duration::from_secs(
            env::var("HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        );

        let fallback = SymbolInfo::default();
        let fallback_precision = SymbolInfo {
            price_precision: env::var("FALLBACK_PRICE_PRECISION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback.price_precision),
            quantity_precision: env::var("FALLBACK_QUANTITY_PRECISION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(fallback.quantity_precision),
            min_quantity: fallback.min_quantity,
        };

        Ok(EngineConfig {
            mongo_uri,
            mongo_db,
            exchange_family,
            exchange_base_url,
            http_timeout,
            fallback_precision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_parsing() {
        assert_eq!("ch".parse::<ExchangeFamily>().unwrap(), ExchangeFamily::Ch);
        assert_eq!("XT".parse::<ExchangeFamily>().unwrap(), ExchangeFamily::Xt);
        assert!("ftx".parse::<ExchangeFamily>().is_err());
    }
}
