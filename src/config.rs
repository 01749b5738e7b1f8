//! Tuning configuration.
//!
//! Defaults mirror the usual profiler settings: five warm-up launches and
//! fifty measured ones per candidate. [`TuneConfig::from_env`] lets a run be
//! adjusted without recompiling:
//!
//! | variable | meaning | default |
//! |---|---|---|
//! | `BRINY_TUNE_WARMUP` | warm-up launches per candidate | `5` |
//! | `BRINY_TUNE_REPEAT` | measured launches per candidate | `50` |
//! | `BRINY_TUNE_BACKEND` | only tune `cpu` or `wgpu` candidates | all |
//! | `BRINY_TUNE_STREAM` | stream id passed to candidates | none |
//!
//! Unparseable values are ignored with a warning and the default is kept.

use crate::backend::Backend;
use crate::stream::{DEFAULT_COLD_NITERS, DEFAULT_NREPEAT, StreamConfig, StreamId};

pub const ENV_WARMUP: &str = "BRINY_TUNE_WARMUP";
pub const ENV_REPEAT: &str = "BRINY_TUNE_REPEAT";
pub const ENV_BACKEND: &str = "BRINY_TUNE_BACKEND";
pub const ENV_STREAM: &str = "BRINY_TUNE_STREAM";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneConfig {
    pub cold_niters: usize,
    pub nrepeat: usize,
    pub backend: Option<Backend>,
    pub stream_id: Option<StreamId>,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            cold_niters: DEFAULT_COLD_NITERS,
            nrepeat: DEFAULT_NREPEAT,
            backend: None,
            stream_id: None,
        }
    }
}

impl TuneConfig {
    /// Reads the `BRINY_TUNE_*` variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            cold_niters: parse_or(ENV_WARMUP, lookup(ENV_WARMUP), defaults.cold_niters),
            nrepeat: parse_or(ENV_REPEAT, lookup(ENV_REPEAT), defaults.nrepeat),
            backend: lookup(ENV_BACKEND).and_then(|raw| match raw.parse::<Backend>() {
                Ok(backend) => Some(backend),
                Err(()) if matches!(raw.trim().to_ascii_lowercase().as_str(), "" | "all" | "any") => None,
                Err(()) => {
                    log::warn!("ignoring {ENV_BACKEND}={raw:?}: expected cpu, wgpu or all");
                    None
                }
            }),
            stream_id: lookup(ENV_STREAM).and_then(|raw| match raw.trim().parse::<u64>() {
                Ok(id) => Some(StreamId(id)),
                Err(_) => {
                    log::warn!("ignoring {ENV_STREAM}={raw:?}: not a stream id");
                    None
                }
            }),
        };
        log::debug!("tune config: {config:?}");
        config
    }

    /// The stream handed to candidates, timing off; the harness flips it as needed.
    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            stream_id: self.stream_id,
            time_kernel: false,
            cold_niters: self.cold_niters,
            nrepeat: self.nrepeat,
        }
    }
}

fn parse_or<T: core::str::FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring {key}={raw:?}: not a valid value");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(TuneConfig::from_lookup(lookup(&[])), TuneConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = TuneConfig::from_lookup(lookup(&[
            (ENV_WARMUP, "1"),
            (ENV_REPEAT, " 10 "),
            (ENV_BACKEND, "wgpu"),
            (ENV_STREAM, "3"),
        ]));
        assert_eq!(config.cold_niters, 1);
        assert_eq!(config.nrepeat, 10);
        assert_eq!(config.backend, Some(Backend::Wgpu));
        assert_eq!(config.stream_id, Some(StreamId(3)));

        let stream = config.stream();
        assert!(!stream.time_kernel);
        assert_eq!(stream.nrepeat, 10);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = TuneConfig::from_lookup(lookup(&[
            (ENV_WARMUP, "lots"),
            (ENV_REPEAT, "-4"),
            (ENV_BACKEND, "tpu"),
            (ENV_STREAM, "x"),
        ]));
        assert_eq!(config, TuneConfig::default());

        let config = TuneConfig::from_lookup(lookup(&[(ENV_BACKEND, "all")]));
        assert_eq!(config.backend, None);
    }
}
