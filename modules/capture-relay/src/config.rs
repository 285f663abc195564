use std::env;
use std::time::Duration;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: String,
    pub nats_url: String,
    pub entity_types: Vec<String>,
    pub poll_interval: Duration,
    pub batch_limit: i64,
    pub source: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bus_type = env::var("BUS_TYPE").unwrap_or_else(|_| "inmemory".to_string());

        let nats_url =
            env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let entity_types = parse_entity_types(
            &env::var("CAPTURE_ENTITY_TYPES")
                .unwrap_or_else(|_| "Order,Customer,Product".to_string()),
        );

        let poll_interval_secs: u64 = env::var("CAPTURE_INTERVAL_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| "CAPTURE_INTERVAL_SECS must be a valid u64".to_string())?;

        let batch_limit: i64 = env::var("CAPTURE_BATCH_LIMIT")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| "CAPTURE_BATCH_LIMIT must be a valid i64".to_string())?;

        let source = env::var("SOURCE_NAME").unwrap_or_else(|_| "capture-relay".to_string());

        Ok(Config {
            database_url,
            bus_type,
            nats_url,
            entity_types,
            poll_interval: Duration::from_secs(poll_interval_secs),
            batch_limit,
            source,
        })
    }
}

fn parse_entity_types(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
