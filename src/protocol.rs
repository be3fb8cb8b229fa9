/*!
Control-socket request protocol.

Requests are ASCII and newline framed (`\r\n` tolerated):
- `hello\n`
- `quit\n`
- `fork <command-line>\n`
- `fork-env <command-line>\n<KEY>: <VALUE>\n...\nend\n`

Reading is bounded by a per-connection deadline; parsing is pure and reports failures as
`ParseError` values which the caller renders into a `FAILURE` response.
*/
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::errors::{ParseError, RequestError};
use crate::util::shell_split;

/// Requests larger than this are rejected outright.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

const FORK_PREFIX: &str = "fork ";
const FORK_ENV_PREFIX: &str = "fork-env ";
const ENV_BLOCK_END: &str = "end\n";
const ENV_BLOCK_TERMINATOR: &str = "\nend\n";

/// Environment changes applied in the child: `Some` sets, `None` unsets.
pub type EnvOverlay = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRequest {
    Hello,
    Quit,
    Fork { argv: Vec<String>, env: EnvOverlay },
    Unknown(String),
}

pub const HELLO_RESPONSE: &str = "ok\nyep, still alive\n";
pub const QUIT_RESPONSE: &str = "ok\nquit command requested... exiting\n";

pub fn failure_response(message: &str) -> String {
    format!("FAILURE\n{message}\n")
}

pub fn unknown_request_response(raw: &str) -> String {
    failure_response(&format!("unknown request: {raw:?}"))
}

pub fn parse_failure_response(e: &ParseError) -> String {
    failure_response(&format!("command or env parsing failed: {e}"))
}

pub fn fork_ok_response(pid: i32, dir: &std::path::Path) -> String {
    format!("ok\n{pid}\n{}\n", dir.display())
}

pub fn exited_response(code: i32) -> String {
    format!("exited\n{code}\n")
}

/// Write a complete response, ignoring a peer that has already gone away.
pub fn send_best_effort<W: Write>(w: &mut W, response: &str) -> bool {
    w.write_all(response.as_bytes()).and_then(|_| w.flush()).is_ok()
}

/// Read one request from `conn`, giving up once `timeout` has elapsed in total.
///
/// Returns the normalised (`\r\n` → `\n`) request text. A `fork-env` request is read until
/// the buffer ends with the `end` terminator line.
pub fn read_request(conn: &UnixStream, timeout: Duration) -> Result<String, RequestError> {
    let deadline = Instant::now() + timeout;
    let mut reader = conn;
    let mut raw: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 1024];

    loop {
        let text = normalize(&raw);
        if request_complete(&text) {
            return Ok(text);
        }
        if raw.len() > MAX_REQUEST_BYTES {
            return Err(RequestError::TooLarge);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RequestError::TimedOut);
        }
        conn.set_read_timeout(Some(remaining))?;
        match reader.read(&mut tmp) {
            Ok(0) => {
                // A peer that half-closes after a fork-env without `end` still gets a parse verdict.
                if text.contains('\n') {
                    return Ok(text);
                }
                return Err(RequestError::Closed);
            }
            Ok(n) => raw.extend_from_slice(&tmp[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn normalize(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).replace("\r\n", "\n")
}

fn request_complete(text: &str) -> bool {
    if !text.contains('\n') {
        return false;
    }
    if text.starts_with(FORK_ENV_PREFIX) {
        return text.ends_with(ENV_BLOCK_TERMINATOR);
    }
    true
}

/// Classify a complete request.
pub fn parse_request(request: &str) -> Result<ParsedRequest, ParseError> {
    match request {
        "hello\n" => return Ok(ParsedRequest::Hello),
        "quit\n" => return Ok(ParsedRequest::Quit),
        _ => {}
    }
    if let Some(rest) = request.strip_prefix(FORK_ENV_PREFIX) {
        let (command, env_block) = rest
            .split_once('\n')
            .ok_or_else(|| ParseError::new("missing newline after command"))?;
        let argv = parse_command(command)?;
        let env = parse_env_block(env_block)?;
        return Ok(ParsedRequest::Fork { argv, env });
    }
    if let Some(rest) = request.strip_prefix(FORK_PREFIX) {
        let command = rest
            .strip_suffix('\n')
            .ok_or_else(|| ParseError::new("missing newline after command"))?;
        if command.contains('\n') {
            return Err(ParseError::new("unexpected data after command line"));
        }
        let argv = parse_command(command)?;
        return Ok(ParsedRequest::Fork {
            argv,
            env: EnvOverlay::new(),
        });
    }
    Ok(ParsedRequest::Unknown(request.to_string()))
}

fn parse_command(command: &str) -> Result<Vec<String>, ParseError> {
    let argv = shell_split(command)?;
    if argv.is_empty() {
        return Err(ParseError::new("empty command"));
    }
    if argv.iter().any(|a| a.contains('\0')) {
        return Err(ParseError::new("command contains a NUL byte"));
    }
    Ok(argv)
}

/// Parse the `KEY: VALUE` lines of a `fork-env` request, which must end with `end\n`.
pub fn parse_env_block(block: &str) -> Result<EnvOverlay, ParseError> {
    let body = if block == ENV_BLOCK_END {
        ""
    } else {
        block
            .strip_suffix(ENV_BLOCK_TERMINATOR)
            .ok_or_else(|| ParseError::new("environment block must end with 'end'"))?
    };
    let mut env = EnvOverlay::new();
    for line in body.split('\n') {
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once(": ") {
            Some((k, v)) => (k, Some(v.to_string())),
            None => match line.strip_suffix(':') {
                Some(k) => (k, None),
                None => {
                    return Err(ParseError::new(format!(
                        "invalid environment line: {line:?}"
                    )))
                }
            },
        };
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(ParseError::new(format!(
                "invalid environment variable name: {key:?}"
            )));
        }
        if value.as_deref().is_some_and(|v| v.contains('\0')) {
            return Err(ParseError::new(format!(
                "value of {key:?} contains a NUL byte"
            )));
        }
        env.insert(key.to_string(), value);
    }
    Ok(env)
}
