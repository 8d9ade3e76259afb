//! Command-line surface.
//!
//! Flags mirror the adapter's configuration one to one; `into_config`
//! performs the cross-flag validation clap cannot express (exactly one
//! transport, at least one bus direction, filter/config pairing) and
//! resolves plugin config paths against `PROTOCOL_LIBRARY_PATH`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::core::config::{AdapterConfig, CanFilterSpec, EndpointMode};
use crate::core::error::{AdapterError, Result};
use crate::framing::{self, FILTERS, FRAMERS};

/// Bridge a GNSS receiver endpoint (serial, file, TCP, UDP, or CAN) onto
/// the message bus.
#[derive(Parser, Debug)]
#[command(name = "epad", version, about)]
pub struct Cli {
    /// Adapter name used in logs and metrics
    #[arg(short = 'n', long = "name")]
    pub name: String,

    /// Bus address to publish endpoint data to
    #[arg(short = 'p', long = "pub", value_name = "ADDR")]
    pub pub_addr: Option<PathBuf>,

    /// Bus address to subscribe for outgoing data
    #[arg(short = 's', long = "sub", value_name = "ADDR")]
    pub sub_addr: Option<PathBuf>,

    /// Framer for endpoint -> bus data
    #[arg(long = "framer-in", default_value = "none")]
    pub framer_in: String,

    /// Framer for bus -> endpoint data
    #[arg(long = "framer-out", default_value = "none")]
    pub framer_out: String,

    /// Filter for endpoint -> bus frames
    #[arg(long = "filter-in", default_value = "none")]
    pub filter_in: String,

    /// Filter for bus -> endpoint frames
    #[arg(long = "filter-out", default_value = "none")]
    pub filter_out: String,

    /// Config file for --filter-in
    #[arg(long = "filter-in-config", value_name = "FILE")]
    pub filter_in_config: Option<PathBuf>,

    /// Config file for --filter-out
    #[arg(long = "filter-out-config", value_name = "FILE")]
    pub filter_out_config: Option<PathBuf>,

    /// Bridge stdin/stdout
    #[arg(long = "stdio")]
    pub stdio: bool,

    /// Open a device or file path
    #[arg(long = "file", value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Listen for one TCP client at a time on this port
    #[arg(long = "tcp-l", value_name = "PORT")]
    pub tcp_l: Option<u16>,

    /// Connect to a TCP server at host:port, reconnecting forever
    #[arg(long = "tcp-c", value_name = "HOST:PORT")]
    pub tcp_c: Option<String>,

    /// Bind a UDP port and reply to the last sender
    #[arg(long = "udp-l", value_name = "PORT")]
    pub udp_l: Option<u16>,

    /// Send UDP datagrams to host:port
    #[arg(long = "udp-c", value_name = "HOST:PORT")]
    pub udp_c: Option<String>,

    /// Use a CAN interface; the value is the 11-bit tx identifier
    #[arg(long = "can", value_name = "ID", value_parser = parse_can_id)]
    pub can: Option<u16>,

    /// CAN receive filter as id[:mask] (defaults to the tx id, exact match)
    #[arg(long = "can-f", value_name = "ID[:MASK]", value_parser = parse_can_filter)]
    pub can_f: Option<CanFilterSpec>,

    /// CAN interface name
    #[arg(long = "can-if", value_name = "IFACE", default_value = "can0")]
    pub can_if: String,

    /// Delay before startup, in milliseconds
    #[arg(long = "startup-delay", value_name = "MS", default_value_t = 0)]
    pub startup_delay: u64,

    /// Open the file transport with O_NONBLOCK
    #[arg(long = "nonblock")]
    pub nonblock: bool,

    /// Verbose logging
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,

    /// TTY output-queue ceiling in bytes; drops writes when exceeded
    #[arg(long = "outq", value_name = "BYTES")]
    pub outq: Option<usize>,

    /// Keep retrying the initial bus connection instead of failing
    #[arg(long = "retry")]
    pub retry: bool,
}

fn parse_can_id(s: &str) -> std::result::Result<u16, String> {
    let id = parse_u32_maybe_hex(s).map_err(|e| format!("invalid CAN id '{}': {}", s, e))?;
    if id > 0x7FF {
        return Err(format!("CAN id 0x{:X} exceeds 11 bits", id));
    }
    Ok(id as u16)
}

fn parse_can_filter(s: &str) -> std::result::Result<CanFilterSpec, String> {
    let (id_str, mask_str) = match s.split_once(':') {
        Some((id, mask)) => (id, Some(mask)),
        None => (s, None),
    };
    let id = parse_u32_maybe_hex(id_str)
        .map_err(|e| format!("invalid CAN filter id '{}': {}", id_str, e))?;
    if id > 0x7FF {
        return Err(format!("CAN filter id 0x{:X} exceeds 11 bits", id));
    }
    let mask = match mask_str {
        Some(m) => {
            parse_u32_maybe_hex(m).map_err(|e| format!("invalid CAN filter mask '{}': {}", m, e))?
        }
        None => 0x7FF,
    };
    Ok(CanFilterSpec { id, mask })
}

fn parse_u32_maybe_hex(s: &str) -> std::result::Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

impl Cli {
    /// Validate the flags and produce the adapter configuration.
    pub fn into_config(self) -> Result<AdapterConfig> {
        if self.pub_addr.is_none() && self.sub_addr.is_none() {
            return Err(AdapterError::Config(
                "at least one of --pub and --sub is required".into(),
            ));
        }

        let mode = self.select_mode()?;

        check_framer(&self.framer_in, "--framer-in")?;
        check_framer(&self.framer_out, "--framer-out")?;
        check_filter(&self.filter_in, "--filter-in")?;
        check_filter(&self.filter_out, "--filter-out")?;

        let base = framing::plugin_base_dir()?;
        let filter_in_config = pair_filter_config(
            &self.filter_in,
            self.filter_in_config,
            base.as_deref(),
            "--filter-in",
        )?;
        let filter_out_config = pair_filter_config(
            &self.filter_out,
            self.filter_out_config,
            base.as_deref(),
            "--filter-out",
        )?;

        Ok(AdapterConfig {
            name: self.name,
            pub_addr: self.pub_addr,
            sub_addr: self.sub_addr,
            framer_in: self.framer_in,
            framer_out: self.framer_out,
            filter_in: self.filter_in,
            filter_out: self.filter_out,
            filter_in_config,
            filter_out_config,
            mode,
            startup_delay: Duration::from_millis(self.startup_delay),
            nonblock: self.nonblock,
            debug: self.debug,
            outq_limit: self.outq,
            bus_retry: self.retry,
        })
    }

    fn select_mode(&self) -> Result<EndpointMode> {
        let mut modes: Vec<EndpointMode> = Vec::new();
        if self.stdio {
            modes.push(EndpointMode::Stdio);
        }
        if let Some(path) = &self.file {
            modes.push(EndpointMode::File(path.clone()));
        }
        if let Some(port) = self.tcp_l {
            modes.push(EndpointMode::TcpListen(port));
        }
        if let Some(addr) = &self.tcp_c {
            modes.push(EndpointMode::TcpConnect(addr.clone()));
        }
        if let Some(port) = self.udp_l {
            modes.push(EndpointMode::UdpListen(port));
        }
        if let Some(addr) = &self.udp_c {
            modes.push(EndpointMode::UdpConnect(addr.clone()));
        }
        if let Some(id) = self.can {
            modes.push(EndpointMode::Can {
                id,
                filter: self.can_f.unwrap_or_else(|| CanFilterSpec::exact(id as u32)),
                interface: self.can_if.clone(),
            });
        }

        match modes.len() {
            0 => Err(AdapterError::Config(
                "no transport selected (--stdio, --file, --tcp-l, --tcp-c, --udp-l, --udp-c, or --can)"
                    .into(),
            )),
            1 => Ok(modes.remove(0)),
            _ => Err(AdapterError::Config(
                "exactly one transport may be selected".into(),
            )),
        }
    }
}

fn check_framer(name: &str, flag: &str) -> Result<()> {
    if FRAMERS.iter().any(|p| p.name == name) {
        Ok(())
    } else {
        Err(AdapterError::Config(format!(
            "{}: unknown framer '{}'",
            flag, name
        )))
    }
}

fn check_filter(name: &str, flag: &str) -> Result<()> {
    if FILTERS.iter().any(|p| p.name == name) {
        Ok(())
    } else {
        Err(AdapterError::Config(format!(
            "{}: unknown filter '{}'",
            flag, name
        )))
    }
}

/// Enforce the filter/config pairing and resolve relative config paths
/// against the plugin base directory.
fn pair_filter_config(
    filter: &str,
    config: Option<PathBuf>,
    base: Option<&std::path::Path>,
    flag: &str,
) -> Result<Option<PathBuf>> {
    let needs = FILTERS
        .iter()
        .find(|p| p.name == filter)
        .map(|p| p.needs_config)
        .unwrap_or(false);

    match (needs, config) {
        (true, None) => Err(AdapterError::Config(format!(
            "filter '{}' ({}) requires {}-config",
            filter, flag, flag
        ))),
        (false, Some(_)) => Err(AdapterError::Config(format!(
            "{}-config given but filter '{}' takes no config",
            flag, filter
        ))),
        (false, None) => Ok(None),
        (true, Some(path)) => {
            let resolved = match (path.is_relative(), base) {
                (true, Some(dir)) => dir.join(path),
                _ => path,
            };
            Ok(Some(resolved))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("epad").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_minimal_stdio_config() {
        let cfg = parse(&["-n", "gnss0", "-p", "/tmp/gnss.pub", "--stdio"])
            .into_config()
            .unwrap();
        assert_eq!(cfg.name, "gnss0");
        assert_eq!(cfg.mode, EndpointMode::Stdio);
        assert!(cfg.wants_pub());
        assert!(!cfg.wants_sub());
    }

    #[test]
    fn test_requires_a_bus_direction() {
        let err = parse(&["-n", "x", "--stdio"]).into_config().unwrap_err();
        assert!(err.to_string().contains("--pub"));
    }

    #[test]
    fn test_requires_exactly_one_transport() {
        assert!(parse(&["-n", "x", "-p", "/tmp/b"]).into_config().is_err());
        assert!(parse(&["-n", "x", "-p", "/tmp/b", "--stdio", "--tcp-l", "5000"])
            .into_config()
            .is_err());
    }

    #[test]
    fn test_can_flags() {
        let cfg = parse(&[
            "-n", "nav", "-s", "/tmp/nav.sub", "--can", "0x123", "--can-f", "0x100:0x700",
            "--can-if", "can1",
        ])
        .into_config()
        .unwrap();
        assert_eq!(
            cfg.mode,
            EndpointMode::Can {
                id: 0x123,
                filter: CanFilterSpec {
                    id: 0x100,
                    mask: 0x700
                },
                interface: "can1".into(),
            }
        );
    }

    #[test]
    fn test_can_filter_defaults_to_exact_tx_id() {
        let cfg = parse(&["-n", "nav", "-s", "/tmp/b", "--can", "291"])
            .into_config()
            .unwrap();
        match cfg.mode {
            EndpointMode::Can { id, filter, .. } => {
                assert_eq!(id, 291);
                assert_eq!(filter, CanFilterSpec::exact(291));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_can_id_must_fit_11_bits() {
        assert!(Cli::try_parse_from(["epad", "-n", "x", "-p", "/tmp/b", "--can", "0x800"]).is_err());
    }

    #[test]
    fn test_filter_config_pairing_is_an_iff() {
        // filter set, config missing
        let err = parse(&[
            "-n", "x", "-p", "/tmp/b", "--stdio", "--filter-in", "prefix",
        ])
        .into_config()
        .unwrap_err();
        assert!(err.to_string().contains("requires"));

        // config set, filter is none
        let err = parse(&[
            "-n",
            "x",
            "-p",
            "/tmp/b",
            "--stdio",
            "--filter-in-config",
            "/tmp/f.conf",
        ])
        .into_config()
        .unwrap_err();
        assert!(err.to_string().contains("takes no config"));
    }

    #[test]
    fn test_unknown_plugin_names_rejected() {
        assert!(parse(&["-n", "x", "-p", "/tmp/b", "--stdio", "--framer-in", "cobs"])
            .into_config()
            .is_err());
        assert!(parse(&["-n", "x", "-p", "/tmp/b", "--stdio", "--filter-out", "regex"])
            .into_config()
            .is_err());
    }
}
