//! Link to the two-channel arbitrary waveform generator.
//!
//! [`Command`] is the SCPI vocabulary the sequencer speaks, [`Transport`]
//! moves bytes, and [`Instrument`] glues the two together with barrier and
//! waveform upload helpers.

use std::{fmt, io};

use serde::{Deserialize, Serialize};

mod command;
mod transport;

pub use command::{arb_upload_prefix, decode_block, encode_block, Command};
pub use transport::{Exchange, SimulatedTransport, TcpTransport, Transport};

/// Output channel of the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    One,
    Two,
}

impl Channel {
    pub const BOTH: [Channel; 2] = [Channel::One, Channel::Two];

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{}", self.number())
    }
}

/// How the sequencer waits for the device to finish previous commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarrierMode {
    /// Send `*WAI`.
    #[default]
    Wait,
    /// Query `*OPC?` and require the answer `1`.
    Confirm,
}

/// Typed wrapper over a [`Transport`].
pub struct Instrument {
    transport: Box<dyn Transport>,
    barrier: BarrierMode,
}

impl Instrument {
    pub fn new(transport: Box<dyn Transport>, barrier: BarrierMode) -> Self {
        Self { transport, barrier }
    }

    pub fn write(&mut self, command: &Command) -> io::Result<()> {
        let text = command.to_string();
        tracing::trace!(command = %text, "write");
        self.transport.write(&text)
    }

    pub fn query(&mut self, command: &Command) -> io::Result<String> {
        let text = command.to_string();
        let reply = self.transport.query(&text)?;
        tracing::trace!(command = %text, %reply, "query");
        Ok(reply)
    }

    /// Blocks until the device has processed everything sent so far.
    pub fn barrier(&mut self) -> io::Result<()> {
        match self.barrier {
            BarrierMode::Wait => self.write(&Command::Wait),
            BarrierMode::Confirm => {
                let reply = self.query(&Command::OperationComplete)?;
                if reply.trim() == "1" {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected *OPC? reply `{reply}`"),
                    ))
                }
            }
        }
    }

    /// Sends `samples` as the arbitrary waveform `name` of `channel`.
    pub fn upload_arb(&mut self, channel: Channel, name: &str, samples: &[f32]) -> io::Result<()> {
        let prefix = arb_upload_prefix(channel, name);
        let block = encode_block(samples);
        tracing::debug!(%channel, name, points = samples.len(), bytes = block.len(), "uploading waveform");
        self.transport.write_block(&prefix, &block)
    }

    pub fn close(&mut self) -> io::Result<()> {
        self.transport.close()
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("barrier", &self.barrier)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_barrier_queries_completion() {
        let sim = SimulatedTransport::new();
        let mut instrument = Instrument::new(Box::new(sim.clone()), BarrierMode::Confirm);

        instrument.barrier().unwrap();
        assert_eq!(sim.commands(), vec!["*OPC?"]);
    }

    #[test]
    fn upload_sends_prefix_and_block() {
        let sim = SimulatedTransport::new();
        let mut instrument = Instrument::new(Box::new(sim.clone()), BarrierMode::Wait);

        instrument.upload_arb(Channel::Two, "MODAL_CH2", &[0.5, -0.5]).unwrap();

        match &sim.transcript()[0] {
            Exchange::Block { command, block } => {
                assert_eq!(command, "SOUR2:DATA:ARB MODAL_CH2,");
                assert_eq!(decode_block(block), Some(vec![0.5, -0.5]));
            }
            other => panic!("unexpected exchange {other:?}"),
        }
    }
}
