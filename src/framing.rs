//! Framing and filtering plugins.
//!
//! A `Framer` extracts discrete frames from a byte stream; a `Filter`
//! accepts or rejects each extracted frame. The byte-level wire formats
//! live behind these two capability traits; the adapter core never
//! inspects payloads itself.
//!
//! Implementations are compiled in and looked up by name through a small
//! registry. `PROTOCOL_LIBRARY_PATH`, when set, names the directory filter
//! configuration files are resolved against; a set-but-missing directory
//! is a fatal startup error.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::core::error::{AdapterError, Result};

/// Environment variable naming the plugin/config base directory.
pub const PROTOCOL_LIBRARY_PATH: &str = "PROTOCOL_LIBRARY_PATH";

/// Extracts discrete frames from a byte stream.
///
/// `consume` is handed the unconsumed remainder of the read buffer and
/// returns how many bytes it consumed plus at most one frame borrowed from
/// that input. Returning `(0, None)` means "need more data".
pub trait Framer: Send {
    fn consume<'a>(&mut self, buf: &'a [u8]) -> (usize, Option<&'a [u8]>);
}

/// Accepts or rejects a single frame.
pub trait Filter: Send {
    fn accept(&mut self, frame: &[u8]) -> bool;
}

// ============================================================================
// Framers
// ============================================================================

/// Pass-through framer: each read chunk is one frame.
pub struct NoneFramer;

impl Framer for NoneFramer {
    fn consume<'a>(&mut self, buf: &'a [u8]) -> (usize, Option<&'a [u8]>) {
        if buf.is_empty() {
            (0, None)
        } else {
            (buf.len(), Some(buf))
        }
    }
}

/// Newline-delimited framer (NMEA-style sentences). The trailing `\n` is
/// part of the frame; a partial line is left unconsumed for the next read.
pub struct LineFramer;

impl Framer for LineFramer {
    fn consume<'a>(&mut self, buf: &'a [u8]) -> (usize, Option<&'a [u8]>) {
        match buf.iter().position(|&b| b == b'\n') {
            Some(idx) => (idx + 1, Some(&buf[..=idx])),
            None => (0, None),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

/// Pass-through filter: accepts every frame.
pub struct NoneFilter;

impl Filter for NoneFilter {
    fn accept(&mut self, _frame: &[u8]) -> bool {
        true
    }
}

/// Accepts frames starting with any of the configured byte prefixes.
///
/// The config file lists one prefix per line; blank lines and lines
/// starting with `#` are ignored.
pub struct PrefixFilter {
    prefixes: Vec<Vec<u8>>,
}

impl PrefixFilter {
    /// Load prefixes from a filter config file.
    pub fn from_config(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AdapterError::Plugin(format!(
                "cannot read filter config {}: {}",
                path.display(),
                e
            ))
        })?;

        let prefixes: Vec<Vec<u8>> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.as_bytes().to_vec())
            .collect();

        if prefixes.is_empty() {
            return Err(AdapterError::Plugin(format!(
                "filter config {} contains no prefixes",
                path.display()
            )));
        }

        Ok(Self { prefixes })
    }
}

impl Filter for PrefixFilter {
    fn accept(&mut self, frame: &[u8]) -> bool {
        self.prefixes.iter().any(|p| frame.starts_with(p))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Registry entry describing one compiled-in framer or filter.
pub struct PluginInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub needs_config: bool,
}

/// Available framers.
pub static FRAMERS: Lazy<Vec<PluginInfo>> = Lazy::new(|| {
    vec![
        PluginInfo {
            name: "none",
            description: "pass each read chunk through as one frame",
            needs_config: false,
        },
        PluginInfo {
            name: "line",
            description: "newline-delimited sentences",
            needs_config: false,
        },
    ]
});

/// Available filters.
pub static FILTERS: Lazy<Vec<PluginInfo>> = Lazy::new(|| {
    vec![
        PluginInfo {
            name: "none",
            description: "accept every frame",
            needs_config: false,
        },
        PluginInfo {
            name: "prefix",
            description: "accept frames matching configured byte prefixes",
            needs_config: true,
        },
    ]
});

/// Resolve the plugin base directory from the environment.
///
/// Returns `Ok(None)` when unset. A set-but-nonexistent directory is fatal.
pub fn plugin_base_dir() -> Result<Option<PathBuf>> {
    match std::env::var_os(PROTOCOL_LIBRARY_PATH) {
        None => Ok(None),
        Some(dir) => {
            let dir = PathBuf::from(dir);
            if dir.is_dir() {
                Ok(Some(dir))
            } else {
                Err(AdapterError::Plugin(format!(
                    "{} points at missing directory {}",
                    PROTOCOL_LIBRARY_PATH,
                    dir.display()
                )))
            }
        }
    }
}

fn known_names(registry: &[PluginInfo]) -> String {
    registry
        .iter()
        .map(|p| p.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Instantiate a framer by registry name.
pub fn make_framer(name: &str) -> Result<Box<dyn Framer>> {
    match name {
        "none" => Ok(Box::new(NoneFramer)),
        "line" => Ok(Box::new(LineFramer)),
        other => Err(AdapterError::Plugin(format!(
            "unknown framer '{}' (available: {})",
            other,
            known_names(&FRAMERS)
        ))),
    }
}

/// Instantiate a filter by registry name. `config` is the filter config
/// path, already resolved against the plugin base directory.
pub fn make_filter(name: &str, config: Option<&Path>) -> Result<Box<dyn Filter>> {
    match name {
        "none" => Ok(Box::new(NoneFilter)),
        "prefix" => {
            let path = config.ok_or_else(|| {
                AdapterError::Plugin("filter 'prefix' requires a config file".into())
            })?;
            Ok(Box::new(PrefixFilter::from_config(path)?))
        }
        other => Err(AdapterError::Plugin(format!(
            "unknown filter '{}' (available: {})",
            other,
            known_names(&FILTERS)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_none_framer_passes_whole_chunk() {
        let mut f = NoneFramer;
        let buf = b"ABCDEFGH";
        let (consumed, frame) = f.consume(buf);
        assert_eq!(consumed, 8);
        assert_eq!(frame, Some(&buf[..]));

        let (consumed, frame) = f.consume(&[]);
        assert_eq!(consumed, 0);
        assert!(frame.is_none());
    }

    #[test]
    fn test_line_framer_splits_on_newline() {
        let mut f = LineFramer;
        let buf = b"$GPGGA,1\n$GPRMC";

        let (consumed, frame) = f.consume(buf);
        assert_eq!(consumed, 9);
        assert_eq!(frame, Some(&b"$GPGGA,1\n"[..]));

        // partial tail stays unconsumed
        let (consumed, frame) = f.consume(&buf[9..]);
        assert_eq!(consumed, 0);
        assert!(frame.is_none());
    }

    #[test]
    fn test_prefix_filter_from_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# GNSS sentences we forward").unwrap();
        writeln!(file, "$GPGGA").unwrap();
        writeln!(file, "$GPRMC").unwrap();
        file.flush().unwrap();

        let mut filter = PrefixFilter::from_config(file.path()).unwrap();
        assert!(filter.accept(b"$GPGGA,123519,4807.038,N"));
        assert!(filter.accept(b"$GPRMC,123519"));
        assert!(!filter.accept(b"$GPGSV,3,1"));
    }

    #[test]
    fn test_empty_filter_config_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(PrefixFilter::from_config(file.path()).is_err());
    }

    #[test]
    fn test_unknown_names_fail() {
        assert!(make_framer("nmea9000").is_err());
        assert!(make_filter("checksum", None).is_err());
    }

    #[test]
    fn test_registry_lists_all_constructible_plugins() {
        for info in FRAMERS.iter() {
            assert!(make_framer(info.name).is_ok(), "framer {}", info.name);
        }
        assert!(make_filter("none", None).is_ok());
        // prefix needs a config, checked separately above
        assert!(FILTERS.iter().any(|p| p.name == "prefix" && p.needs_config));
    }
}
