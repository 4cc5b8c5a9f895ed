//! Command-line interface definitions for interpose.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Intercepting HTTP/HTTPS proxy.
///
/// interpose answers explicit proxy requests (plain HTTP and CONNECT) and,
/// optionally, raw TLS redirected to a transparent port. TLS is terminated
/// with certificates forged on the fly by a local CA.
#[derive(Parser, Debug, Default)]
#[command(name = "interpose")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Explicit proxy port.
    ///
    /// Overrides `[proxy] port` (default 3128).
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Transparent interception port.
    ///
    /// Connections redirected here must start with a TLS ClientHello
    /// carrying SNI. Disabled unless set here or in `[proxy]`.
    #[arg(short = 't', long = "transparent-port", value_name = "PORT")]
    pub transparent_port: Option<u16>,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// CA certificate used to sign intercepted domains.
    ///
    /// Without a CA, an ephemeral one is generated for this run.
    #[arg(long = "ca-cert", value_name = "PATH", requires = "ca_key")]
    pub ca_cert: Option<PathBuf>,

    /// Private key of the CA certificate.
    #[arg(long = "ca-key", value_name = "PATH", requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["interpose"]).unwrap();
        assert!(cli.port.is_none());
        assert!(cli.transparent_port.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_parse_ports_and_verbosity() {
        let cli =
            Cli::try_parse_from(["interpose", "--port", "8080", "-t", "8443", "-vv"]).unwrap();
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.transparent_port, Some(8443));
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_ca_flags_come_in_pairs() {
        assert!(Cli::try_parse_from(["interpose", "--ca-cert", "ca.crt"]).is_err());
        let cli = Cli::try_parse_from(["interpose", "--ca-cert", "ca.crt", "--ca-key", "ca.key"])
            .unwrap();
        assert_eq!(cli.ca_key, Some(PathBuf::from("ca.key")));
    }

    #[test]
    fn test_invalid_port_rejected() {
        assert!(Cli::try_parse_from(["interpose", "--port", "70000"]).is_err());
    }
}
