//! Backend tags.
//!
//! Every candidate declares the backend it runs on. The harness does not
//! care, but reports carry the tag and [`Registry::retain_backend`] can
//! narrow a registry to one backend (see `BRINY_TUNE_BACKEND` in
//! [`TuneConfig`]).
//!
//! # Supported Backends
//!
//! - `Cpu`: pure Rust kernels, multi-threaded with `rayon` (default).
//! - `Wgpu`: compute shaders through `wgpu` (requires the `wgpu` feature).
//!
//! [`Registry::retain_backend`]: crate::registry::Registry::retain_backend
//! [`TuneConfig`]: crate::config::TuneConfig

use core::fmt;
use core::str::FromStr;

/// Enumeration of computation backends a candidate can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Backend {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu,
    /// GPU-accelerated backend using `wgpu`.
    Wgpu,
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Wgpu => f.write_str("wgpu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays_names() {
        assert_eq!("CPU".parse::<Backend>(), Ok(Backend::Cpu));
        assert_eq!(" gpu ".parse::<Backend>(), Ok(Backend::Wgpu));
        assert_eq!("cuda".parse::<Backend>(), Err(()));
        assert_eq!("".parse::<Backend>(), Err(()));
        assert_eq!(Backend::Wgpu.to_string(), "wgpu");
    }
}
