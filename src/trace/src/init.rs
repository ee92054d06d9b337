use std::{str::FromStr, sync::Arc};

use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, Registry};

use crate::error::Error;

pub const FORMAT_JSON: &str = "json";
pub const FORMAT_PLAIN: &str = "plain";

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            level: "info".to_string(),
            format: FORMAT_PLAIN.to_string(),
            file: None,
        }
    }
}

/// Installs the global subscriber.
///
/// Fails when a subscriber is already installed, so callers that may run more
/// than once (tests) should ignore the error.
pub fn prepare_tracing(conf: TraceConfig) -> Result<(), Error> {
    let level = LevelFilter::from_str(&conf.level)
        .map_err(|_| Error::InvalidLevel(conf.level.clone()))?;

    let file_layer = match conf.file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(fmt::Layer::new().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    let (json_layer, plain_layer) = if conf.format == FORMAT_JSON {
        (Some(fmt::Layer::new().json()), None)
    } else {
        (None, Some(fmt::Layer::new().with_ansi(true)))
    };

    Registry::default()
        .with(file_layer)
        .with(json_layer)
        .with(plain_layer)
        .with(level)
        .try_init()
        .map_err(Error::Init)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_prepare_tracing_with_invalid_level() {
        let res = prepare_tracing(TraceConfig {
            level: "loud".to_string(),
            ..Default::default()
        });
        match res {
            Ok(_) => panic!("this test should be failed"),
            Err(e) => assert!(matches!(e, Error::InvalidLevel(l) if l == "loud")),
        }
    }
}
