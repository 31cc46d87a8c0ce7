use std::{
    io::{self, BufRead, BufReader, Write},
    net::TcpStream,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

/// Request/response channel to the instrument.
///
/// Implementations send one newline-terminated message per call and never
/// pipeline: `query` returns only after the reply line has been read.
pub trait Transport: Send {
    fn write(&mut self, command: &str) -> io::Result<()>;

    /// Sends `command` immediately followed by a binary `block`.
    fn write_block(&mut self, command: &str, block: &[u8]) -> io::Result<()>;

    fn query(&mut self, command: &str) -> io::Result<String>;

    fn close(&mut self) -> io::Result<()>;
}

/// Raw SCPI socket (LAN port 5025 on Keysight generators).
#[derive(Debug)]
pub struct TcpTransport {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpTransport {
    pub const DEFAULT_PORT: u16 = 5025;

    /// Connects to `address` (`host` or `host:port`). `timeout` bounds each
    /// read and write; `None` leaves the socket blocking.
    pub fn connect(address: &str, timeout: Option<Duration>) -> io::Result<Self> {
        let stream = TcpStream::connect(Self::with_default_port(address))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            writer: stream,
            reader,
        })
    }

    /// Appends the SCPI socket port when `address` names only a host.
    pub fn with_default_port(address: &str) -> String {
        if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{}", Self::DEFAULT_PORT)
        }
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, command: &str) -> io::Result<()> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn write_block(&mut self, command: &str, block: &[u8]) -> io::Result<()> {
        self.writer.write_all(command.as_bytes())?;
        self.writer.write_all(block)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    fn query(&mut self, command: &str) -> io::Result<String> {
        self.write(command)?;
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "instrument closed the connection",
            ));
        }
        Ok(line.trim_end().to_string())
    }

    fn close(&mut self) -> io::Result<()> {
        match self.writer.shutdown(std::net::Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }
}

/// One message as seen by a [`SimulatedTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange {
    Write(String),
    Block { command: String, block: Vec<u8> },
    Query { command: String, reply: String },
    Close,
}

impl Exchange {
    /// Command text without the binary payload.
    pub fn command(&self) -> &str {
        match self {
            Self::Write(command) => command,
            Self::Block { command, .. } => command,
            Self::Query { command, .. } => command,
            Self::Close => "",
        }
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    transcript: Vec<Exchange>,
    failing_prefixes: Vec<String>,
    tracking: bool,
    closed: bool,
}

/// In-process stand-in for the generator.
///
/// Records every exchange, answers identity, completion and tracking
/// queries, and fails any command starting with a registered prefix.
/// Clones share the same transcript, so a test can keep one handle while the
/// session owns another.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedTransport {
    pub const IDENTITY: &'static str = "Agilent Technologies,33622A,SIMULATED,0.0";

    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later command beginning with `prefix` fail.
    pub fn fail_on(&self, prefix: impl Into<String>) {
        self.lock().failing_prefixes.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        self.lock().failing_prefixes.clear();
    }

    pub fn transcript(&self) -> Vec<Exchange> {
        self.lock().transcript.clone()
    }

    /// Command texts of the transcript, payloads omitted.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .transcript
            .iter()
            .filter(|exchange| !matches!(exchange, Exchange::Close))
            .map(|exchange| exchange.command().to_string())
            .collect()
    }

    pub fn clear_transcript(&self) {
        self.lock().transcript.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedState> {
        // A panic while holding the lock only happens inside tests; the state
        // is still readable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(state: &SimulatedState, command: &str) -> io::Result<()> {
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link is closed"));
        }
        if state
            .failing_prefixes
            .iter()
            .any(|prefix| command.starts_with(prefix.as_str()))
        {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated failure for `{command}`"),
            ));
        }
        Ok(())
    }
}

impl Transport for SimulatedTransport {
    fn write(&mut self, command: &str) -> io::Result<()> {
        let mut state = self.lock();
        Self::check(&state, command)?;
        match command {
            "SOUR2:TRACK ON" => state.tracking = true,
            "SOUR2:TRACK OFF" => state.tracking = false,
            _ => {}
        }
        state.transcript.push(Exchange::Write(command.to_string()));
        Ok(())
    }

    fn write_block(&mut self, command: &str, block: &[u8]) -> io::Result<()> {
        let mut state = self.lock();
        Self::check(&state, command)?;
        state.transcript.push(Exchange::Block {
            command: command.to_string(),
            block: block.to_vec(),
        });
        Ok(())
    }

    fn query(&mut self, command: &str) -> io::Result<String> {
        let mut state = self.lock();
        Self::check(&state, command)?;
        let reply = match command {
            "*IDN?" => Self::IDENTITY.to_string(),
            "*OPC?" => "1".to_string(),
            "SOUR2:TRACK?" => if state.tracking { "1" } else { "0" }.to_string(),
            _ => String::new(),
        };
        state.transcript.push(Exchange::Query {
            command: command.to_string(),
            reply: reply.clone(),
        });
        Ok(reply)
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        state.closed = true;
        state.transcript.push(Exchange::Close);
        Ok(())
    }
}
