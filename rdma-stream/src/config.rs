//! Command-line configuration: argument parsing via `getopts` and the
//! `fput`/`fget` personality split.
//!
//! Both binaries link this one module and dispatch on `argv[0]` so the
//! flag surface and defaults live in one place; see `SPEC_FULL.md`'s
//! external-interfaces section for the exact flags each personality
//! accepts.

use getopts::Options;

use crate::error::{Error, Result};

/// Default buffer size, in bytes, for both the transmitter's source
/// buffers and the receiver's target buffers.
pub const DEFAULT_BUFLEN: usize = 1 << 20;
/// Default number of payload buffers each side keeps in flight.
pub const DEFAULT_NBUFFERS: usize = 8;
/// Default number of control buffers (vector/progress) primed up front.
pub const DEFAULT_CONTROL_BUFS: usize = 4;
/// Bind address used when `fget` is not given `-b`.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4242";

/// A fully parsed invocation of either `fput` or `fget`.
#[derive(Debug)]
pub enum Config {
    /// `fput [-r] [-g] <peer-address>`
    Put {
        /// Address (host:port) of the listening `fget`.
        peer_addr: String,
        /// `-r`: renegotiate registration on every advertisement cycle
        /// instead of keeping one key for the life of the connection.
        reregister: bool,
        /// `-g`: restrict writes to a single contiguous gather segment
        /// per advertisement instead of fragmenting across all of them.
        contiguous_only: bool,
    },
    /// `fget [-b <bind-address>] [-r]`
    Get {
        /// Address to listen on for the transmitter's handshake.
        bind_addr: String,
        /// `-r`: deregister a target immediately after each release
        /// instead of keeping it registered for reuse.
        reregister: bool,
    },
}

/// Parses `args` (excluding argv[0]) according to which personality
/// `program_name` names. `program_name` is matched by suffix so it works
/// whether the binary was invoked as `fput`, `./fput`, or with a `.exe`
/// extension.
pub fn parse(program_name: &str, args: &[String]) -> Result<Config> {
    if program_name.ends_with("fput") {
        parse_put(args)
    } else if program_name.ends_with("fget") {
        parse_get(args)
    } else {
        Err(Error::config(format!("unrecognized program name {program_name:?}: invoke as fput or fget")))
    }
}

fn parse_put(args: &[String]) -> Result<Config> {
    let mut opts = Options::new();
    opts.optflag("r", "reregister", "reregister a target's memory key on every advertisement cycle");
    opts.optflag("g", "contiguous", "restrict each write to a single contiguous gather segment");
    opts.optflag("h", "help", "print usage and exit");
    let matches = opts.parse(args).map_err(|e| Error::config(e.to_string()))?;
    if matches.opt_present("h") {
        return Err(Error::config(opts.usage("usage: fput [-r] [-g] <peer-address>")));
    }
    let peer_addr = matches.free.first().cloned().ok_or_else(|| Error::config("fput requires a peer address"))?;
    Ok(Config::Put { peer_addr, reregister: matches.opt_present("r"), contiguous_only: matches.opt_present("g") })
}

fn parse_get(args: &[String]) -> Result<Config> {
    let mut opts = Options::new();
    opts.optopt("b", "bind", "address to listen on", "ADDRESS");
    opts.optflag("r", "reregister", "deregister a target immediately after each release");
    opts.optflag("h", "help", "print usage and exit");
    let matches = opts.parse(args).map_err(|e| Error::config(e.to_string()))?;
    if matches.opt_present("h") {
        return Err(Error::config(opts.usage("usage: fget [-b <bind-address>] [-r]")));
    }
    let bind_addr = matches.opt_str("b").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
    Ok(Config::Get { bind_addr, reregister: matches.opt_present("r") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_requires_peer_address() {
        let error = parse_put(&[]).unwrap_err();
        assert!(matches!(error, Error::Config(_)));
    }

    #[test]
    fn put_parses_flags_and_positional() {
        let args: Vec<String> = vec!["-r".into(), "-g".into(), "host:4242".into()];
        match parse_put(&args).unwrap() {
            Config::Put { peer_addr, reregister, contiguous_only } => {
                assert_eq!(peer_addr, "host:4242");
                assert!(reregister);
                assert!(contiguous_only);
            }
            _ => panic!("expected Config::Put"),
        }
    }

    #[test]
    fn get_defaults_bind_address() {
        match parse_get(&[]).unwrap() {
            Config::Get { bind_addr, reregister } => {
                assert_eq!(bind_addr, DEFAULT_BIND_ADDR);
                assert!(!reregister);
            }
            _ => panic!("expected Config::Get"),
        }
    }

    #[test]
    fn dispatch_by_program_name() {
        assert!(matches!(parse("/usr/bin/fput", &["host:4242".into()]).unwrap(), Config::Put { .. }));
        assert!(matches!(parse("fget", &[]).unwrap(), Config::Get { .. }));
        assert!(parse("other", &[]).is_err());
    }
}
