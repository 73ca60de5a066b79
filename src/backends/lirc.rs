//! IR remotes through the lircd socket.
//!
//! lircd broadcasts one line per decoded frame:
//!
//! ```text
//! 0000000000f40bf0 00 KEY_UP devinput
//! <code>           <repeat> <button> <remote>
//! ```
//!
//! Code and repeat counter are hexadecimal. Replies to client commands are framed
//! by `BEGIN`/`END` and carry no button data.

use crate::device::{SampleError, Sampler};
use crate::event::{Code, RawEvent, RawState, SourceKind};
use std::io::{self, BufRead, BufReader};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// One decoded lircd broadcast line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrFrame {
    pub code: u64,
    pub repeat: u32,
    /// Upper-cased button name.
    pub button: String,
    pub remote: String,
}

/// Parse a broadcast line. `Ok(None)` for protocol framing that carries no frame.
pub fn parse_line(line: &str) -> Result<Option<IrFrame>, SampleError> {
    let line = line.trim();
    if line.is_empty() || matches!(line, "BEGIN" | "END" | "SIGHUP" | "SUCCESS" | "ERROR" | "DATA") {
        return Ok(None);
    }
    let malformed = || SampleError::Malformed(format!("lircd line {line:?}"));
    let mut fields = line.split_whitespace();
    let (Some(code), Some(repeat), Some(button), Some(remote), None) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(malformed());
    };
    Ok(Some(IrFrame {
        code: u64::from_str_radix(code, 16).map_err(|_| malformed())?,
        repeat: u32::from_str_radix(repeat, 16).map_err(|_| malformed())?,
        button: button.to_ascii_uppercase(),
        remote: remote.to_string(),
    }))
}

pub struct LircSampler {
    path: PathBuf,
    name: String,
    reader: Option<BufReader<UnixStream>>,
    line: Vec<u8>,
}

impl LircSampler {
    /// Does not connect; the first [`sample`](Sampler::sample) reports the socket
    /// as unavailable and the pipeline's recovery connects it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("ir:{}", path.display()),
            path,
            reader: None,
            line: Vec::new(),
        }
    }

    /// Connect right away.
    pub fn connect(path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut sampler = Self::new(path);
        sampler.open()?;
        Ok(sampler)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    fn open(&mut self) -> io::Result<()> {
        let stream = UnixStream::connect(&self.path)?;
        self.reader = Some(BufReader::new(stream));
        self.line.clear();
        debug!(path = %self.path.display(), "connected to lircd");
        Ok(())
    }

    fn disconnect(&mut self, reason: String) -> SampleError {
        self.reader = None;
        self.line.clear();
        SampleError::Unavailable(reason)
    }
}

impl Sampler for LircSampler {
    fn source(&self) -> SourceKind {
        SourceKind::Ir
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn sample(&mut self, timeout: Duration) -> Result<Option<RawEvent>, SampleError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(SampleError::Unavailable(format!(
                "not connected to {}",
                self.path.display()
            )));
        };
        // A zero timeout would mean "block forever".
        reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        // Partial lines stay in `self.line` across timeouts.
        match reader.read_until(b'\n', &mut self.line) {
            Ok(0) => Err(self.disconnect("lircd closed the connection".into())),
            Ok(_) if !self.line.ends_with(b"\n") => Ok(None),
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                let Some(frame) = parse_line(&line)? else {
                    trace!(%line, "lircd framing");
                    return Ok(None);
                };
                Ok(Some(RawEvent {
                    source: SourceKind::Ir,
                    code: Code::Ir(frame.button),
                    state: RawState::IrCode {
                        repeat: frame.repeat,
                    },
                    at: Instant::now(),
                }))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(self.disconnect(e.to_string())),
        }
    }

    fn recover(&mut self) -> Result<(), SampleError> {
        self.open().map_err(SampleError::from)
    }
}
