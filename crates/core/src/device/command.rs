use std::fmt;

use crate::catalog::Polarity;

use super::Channel;

/// Text commands understood by the two-channel generator.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Identify,
    /// `*WAI`: the device finishes pending operations before the next command.
    Wait,
    /// `*OPC?`: answers `1` once pending operations are complete.
    OperationComplete,
    MakeDirectory(String),
    ByteOrderSwap,
    ClearVolatile(Channel),
    StoreArb { directory: String, name: String },
    FunctionArb(Channel),
    SelectArb(Channel, String),
    SampleRate(Channel, f64),
    Amplitude(Channel, f64),
    Offset(Channel, f64),
    Frequency(Channel, f64),
    Phase(Channel, f64),
    /// Channel 2 follows channel 1 frequency and phase.
    Track(bool),
    TrackQuery,
    PhaseSync,
    PhaseReferenceInternal,
    FrequencyCoupling(bool),
    PhaseCoupling(bool),
    Polarity(Channel, Polarity),
    SyncOutput(bool),
    SyncSource(Channel),
    SyncMarkerMode,
    Output(Channel, bool),
    DisplayText(String),
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Identify => f.write_str("*IDN?"),
            Self::Wait => f.write_str("*WAI"),
            Self::OperationComplete => f.write_str("*OPC?"),
            Self::MakeDirectory(dir) => write!(f, "MMEMORY:MDIR \"INT:\\{dir}\""),
            Self::ByteOrderSwap => f.write_str("FORM:BORD SWAP"),
            Self::ClearVolatile(ch) => write!(f, "SOUR{}:DATA:VOL:CLE", ch.number()),
            Self::StoreArb { directory, name } => {
                write!(f, "MMEM:STOR:DATA \"INT:\\{directory}\\{name}.arb\"")
            }
            Self::FunctionArb(ch) => write!(f, "SOUR{}:FUNC ARB", ch.number()),
            Self::SelectArb(ch, name) => write!(f, "SOUR{}:FUNC:ARB {name}", ch.number()),
            Self::SampleRate(ch, rate) => write!(f, "SOUR{}:FUNC:ARB:SRAT {rate}", ch.number()),
            Self::Amplitude(ch, volts) => write!(f, "SOUR{}:VOLT {volts}", ch.number()),
            Self::Offset(ch, volts) => write!(f, "SOUR{}:VOLT:OFFS {volts}", ch.number()),
            Self::Frequency(ch, hz) => write!(f, "SOUR{}:FREQ {hz}", ch.number()),
            Self::Phase(ch, degrees) => write!(f, "SOUR{}:PHAS {degrees}", ch.number()),
            Self::Track(enabled) => write!(f, "SOUR2:TRACK {}", on_off(*enabled)),
            Self::TrackQuery => f.write_str("SOUR2:TRACK?"),
            Self::PhaseSync => f.write_str("SOUR2:PHAS:SYNC"),
            Self::PhaseReferenceInternal => f.write_str("PHAS:REF INT"),
            Self::FrequencyCoupling(enabled) => write!(f, "SOUR:FREQ:COUP {}", on_off(*enabled)),
            Self::PhaseCoupling(enabled) => write!(f, "SOUR:PHAS:COUP {}", on_off(*enabled)),
            Self::Polarity(ch, polarity) => {
                write!(f, "OUTP{}:POL {}", ch.number(), polarity.keyword())
            }
            Self::SyncOutput(enabled) => write!(f, "OUTP:SYNC {}", on_off(*enabled)),
            Self::SyncSource(ch) => write!(f, "OUTP:SYNC:SOURCE CH{}", ch.number()),
            Self::SyncMarkerMode => f.write_str("OUTP:SYNC:MODE MARK"),
            Self::Output(ch, enabled) => write!(f, "OUTP{} {}", ch.number(), on_off(*enabled)),
            Self::DisplayText(text) => write!(f, "DISP:TEXT '{text}'"),
        }
    }
}

/// Command prefix for a binary arbitrary-waveform upload. The data block
/// follows directly after the trailing comma.
pub fn arb_upload_prefix(channel: Channel, name: &str) -> String {
    format!("SOUR{}:DATA:ARB {name},", channel.number())
}

/// Encodes samples as an IEEE 488.2 definite-length block of little-endian
/// f32 values: `#<digit count><byte count><bytes>`.
pub fn encode_block(samples: &[f32]) -> Vec<u8> {
    let byte_count = samples.len() * std::mem::size_of::<f32>();
    let length = byte_count.to_string();
    let mut block = Vec::with_capacity(2 + length.len() + byte_count);
    block.push(b'#');
    block.extend_from_slice(length.len().to_string().as_bytes());
    block.extend_from_slice(length.as_bytes());
    for sample in samples {
        block.extend_from_slice(&sample.to_le_bytes());
    }
    block
}

/// Inverse of [`encode_block`]. Returns `None` for anything that is not a
/// well-formed block of whole f32 values.
pub fn decode_block(block: &[u8]) -> Option<Vec<f32>> {
    let (&marker, rest) = block.split_first()?;
    if marker != b'#' {
        return None;
    }
    let (&digits, rest) = rest.split_first()?;
    let digits = (digits as char).to_digit(10)? as usize;
    if digits == 0 || rest.len() < digits {
        return None;
    }
    let byte_count: usize = std::str::from_utf8(&rest[..digits]).ok()?.parse().ok()?;
    let payload = &rest[digits..];
    if payload.len() != byte_count || byte_count % 4 != 0 {
        return None;
    }
    Some(
        payload
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_scpi_text() {
        let cases = [
            (Command::Identify, "*IDN?"),
            (Command::MakeDirectory("remoteAdded".into()), "MMEMORY:MDIR \"INT:\\remoteAdded\""),
            (
                Command::StoreArb {
                    directory: "remoteAdded".into(),
                    name: "MODAL_CH1".into(),
                },
                "MMEM:STOR:DATA \"INT:\\remoteAdded\\MODAL_CH1.arb\"",
            ),
            (Command::SampleRate(Channel::Two, 2_000_000.0), "SOUR2:FUNC:ARB:SRAT 2000000"),
            (Command::Amplitude(Channel::One, 2.0), "SOUR1:VOLT 2"),
            (Command::Frequency(Channel::One, 1250.5), "SOUR1:FREQ 1250.5"),
            (Command::Track(true), "SOUR2:TRACK ON"),
            (Command::Polarity(Channel::Two, Polarity::Inverted), "OUTP2:POL INV"),
            (Command::SyncSource(Channel::One), "OUTP:SYNC:SOURCE CH1"),
            (Command::Output(Channel::One, false), "OUTP1 OFF"),
            (Command::DisplayText(String::new()), "DISP:TEXT ''"),
        ];

        for (command, expected) in cases {
            assert_eq!(command.to_string(), expected);
        }
    }

    #[test]
    fn block_header_counts_bytes() {
        let block = encode_block(&[1.0, -1.0, 0.5]);

        assert_eq!(&block[..4], b"#212");
        assert_eq!(block.len(), 4 + 12);
        assert_eq!(&block[4..8], &1.0_f32.to_le_bytes());
        assert_eq!(decode_block(&block), Some(vec![1.0, -1.0, 0.5]));
    }

    #[test]
    fn large_block_header_uses_more_digits() {
        let samples = vec![0.25_f32; 2000];
        let block = encode_block(&samples);

        assert_eq!(&block[..6], b"#48000");
        assert_eq!(decode_block(&block).unwrap().len(), 2000);
    }

    #[test]
    fn rejects_truncated_blocks() {
        let mut block = encode_block(&[1.0, 2.0]);
        block.pop();
        assert_eq!(decode_block(&block), None);
        assert_eq!(decode_block(b"abc"), None);
    }
}
