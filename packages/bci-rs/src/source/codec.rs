//! Wire codec for the acquisition-server protocol.
//!
//! Commands are single bytes. Every response is framed as a 4-byte
//! big-endian signed length followed by that many payload bytes. Payloads are
//! either ISO-8859-1 text (header, channel names) or a binary block of
//! 4-byte big-endian elements interleaved sample by sample.

use crate::error::{StreamError, StreamResult};
use crate::types::{FormatCode, ELEMENT_WIDTH};
use byteorder::{BigEndian, ByteOrder};
use ndarray::Array2;

/// Size of the length prefix in front of every message
pub const LENGTH_PREFIX: usize = 4;

/// Largest payload accepted from the server (64 MiB)
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Highest trigger code accepted by the server
pub const MAX_TRIGGER: u8 = 64;

/// Single-byte protocol commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Header,
    Names,
    Request,
    Flush,
    Kill,
    Trigger(u8),
}

impl Command {
    /// Build a trigger command, rejecting codes outside 1..=64
    pub fn trigger(code: u8) -> StreamResult<Self> {
        if (1..=MAX_TRIGGER).contains(&code) {
            Ok(Self::Trigger(code))
        } else {
            Err(StreamError::InvalidInput(format!(
                "Trigger {} outside the range [1, {}]",
                code, MAX_TRIGGER
            )))
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            Self::Header => b'H',
            Self::Names => b'N',
            Self::Request => b'R',
            Self::Flush => b'F',
            Self::Kill => b'K',
            Self::Trigger(code) => *code,
        }
    }
}

/// Validate a decoded length prefix
pub fn payload_length(prefix: [u8; LENGTH_PREFIX]) -> StreamResult<usize> {
    let len = BigEndian::read_i32(&prefix);
    let len = usize::try_from(len)
        .map_err(|_| StreamError::Framing(format!("Negative payload length {}", len)))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(StreamError::Framing(format!(
            "Payload length {} exceeds the {} byte limit",
            len, MAX_PAYLOAD_LEN
        )));
    }
    Ok(len)
}

/// Frame a payload with its length prefix
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; LENGTH_PREFIX];
    BigEndian::write_i32(&mut frame, payload.len() as i32);
    frame.extend_from_slice(payload);
    frame
}

/// Payload text is ISO-8859-1, so every byte maps to one char
pub fn latin1(payload: &[u8]) -> String {
    payload.iter().map(|&b| b as char).collect()
}

/// Raw header fields, before they are combined with the channel names
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub hardware: String,
    pub fs: f64,
    pub data_format: Vec<FormatCode>,
    pub channel_count: usize,
}

/// Parse a `KEY=value,KEY=value` header payload
pub fn parse_header(payload: &[u8]) -> StreamResult<Header> {
    let text = latin1(payload);

    let mut name = None;
    let mut hardware = None;
    let mut fs = None;
    let mut data_format = None;
    let mut channel_count = None;

    for field in text.split(',') {
        let field = field.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if field.is_empty() {
            continue;
        }

        let Some((key, value)) = field.split_once('=') else {
            log::warn!("Ignoring header field without '=': {:?}", field);
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "NAME" => name = Some(value.to_string()),
            "HARDWARE" => hardware = Some(value.to_string()),
            "FS" => {
                let parsed: f64 = value
                    .parse()
                    .map_err(|_| StreamError::Protocol(format!("Invalid FS value {:?}", value)))?;
                if !(parsed.is_finite() && parsed > 0.0) {
                    return Err(StreamError::Protocol(format!(
                        "Sampling frequency must be positive, got {}",
                        parsed
                    )));
                }
                fs = Some(parsed);
            }
            "DATA" => data_format = Some(FormatCode::parse_sequence(value)?),
            "#CH" => {
                channel_count = Some(value.parse().map_err(|_| {
                    StreamError::Protocol(format!("Invalid #CH value {:?}", value))
                })?)
            }
            other => log::debug!("Ignoring unknown header key {:?}", other),
        }
    }

    let missing = |key: &str| StreamError::Protocol(format!("Header is missing {}", key));

    Ok(Header {
        name: name.ok_or_else(|| missing("NAME"))?,
        hardware: hardware.ok_or_else(|| missing("HARDWARE"))?,
        fs: fs.ok_or_else(|| missing("FS"))?,
        data_format: data_format.ok_or_else(|| missing("DATA"))?,
        channel_count: channel_count.ok_or_else(|| missing("#CH"))?,
    })
}

/// Parse a comma-separated channel-names payload
pub fn parse_channel_names(payload: &[u8]) -> Vec<String> {
    latin1(payload)
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .split(',')
        .map(|name| name.trim().to_string())
        .collect()
}

fn decode_element(code: FormatCode, bytes: &[u8]) -> f64 {
    match code {
        FormatCode::Float32 => BigEndian::read_f32(bytes) as f64,
        FormatCode::Int32 => BigEndian::read_i32(bytes) as f64,
        FormatCode::UInt32 => BigEndian::read_u32(bytes) as f64,
    }
}

fn encode_element(code: FormatCode, value: f64, bytes: &mut [u8]) {
    match code {
        FormatCode::Float32 => BigEndian::write_f32(bytes, value as f32),
        FormatCode::Int32 => BigEndian::write_i32(bytes, value as i32),
        FormatCode::UInt32 => BigEndian::write_u32(bytes, value as u32),
    }
}

/// Decode a binary data payload into a `[n_samples, n_columns]` matrix
///
/// Each column is decoded with its own format code.
pub fn decode_data(payload: &[u8], format: &[FormatCode]) -> StreamResult<Array2<f64>> {
    let n_columns = format.len();
    if n_columns == 0 {
        return Err(StreamError::Protocol(
            "Cannot decode data without a data format".to_string(),
        ));
    }

    let row_bytes = ELEMENT_WIDTH * n_columns;
    if payload.len() % row_bytes != 0 {
        return Err(StreamError::Protocol(format!(
            "Data payload of {} bytes is not a whole number of {}-byte rows",
            payload.len(),
            row_bytes
        )));
    }
    let n_samples = payload.len() / row_bytes;

    let values: Vec<f64> = payload
        .chunks_exact(ELEMENT_WIDTH)
        .enumerate()
        .map(|(i, bytes)| decode_element(format[i % n_columns], bytes))
        .collect();

    Array2::from_shape_vec((n_samples, n_columns), values)
        .map_err(|e| StreamError::Protocol(format!("Data payload shape: {}", e)))
}

/// Encode a sample matrix the way the acquisition server sends it
pub fn encode_data(samples: &Array2<f64>, format: &[FormatCode]) -> StreamResult<Vec<u8>> {
    if samples.ncols() != format.len() {
        return Err(StreamError::shape(
            format!("{} columns", format.len()),
            format!("{} columns", samples.ncols()),
        ));
    }

    let mut payload = vec![0u8; samples.len() * ELEMENT_WIDTH];
    for ((i, value), bytes) in samples
        .iter()
        .enumerate()
        .zip(payload.chunks_exact_mut(ELEMENT_WIDTH))
    {
        encode_element(format[i % format.len()], *value, bytes);
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_decode_known_matrix() {
        let samples = array![[1.5, 7.0], [-2.25, 8.0], [3.0, 9.0]];
        let format = vec![FormatCode::Float32, FormatCode::Int32];

        let payload = encode_data(&samples, &format).unwrap();
        assert_eq!(payload.len(), 3 * 2 * ELEMENT_WIDTH);

        let decoded = decode_data(&payload, &format).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_elements_are_big_endian_and_row_interleaved() {
        // 1.0f32 = 0x3F800000, then i32 2
        let payload = [0x3F, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02];
        let decoded = decode_data(&payload, &[FormatCode::Float32, FormatCode::Int32]).unwrap();
        assert_eq!(decoded.shape(), &[1, 2]);
        assert_eq!(decoded[[0, 0]], 1.0);
        assert_eq!(decoded[[0, 1]], 2.0);
    }

    #[test]
    fn test_partial_row_is_protocol_error() {
        let err = decode_data(&[0u8; 12], &[FormatCode::Float32, FormatCode::Float32]).unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
    }

    #[test]
    fn test_empty_payload_decodes_to_zero_rows() {
        let decoded = decode_data(&[], &[FormatCode::Float32; 3]).unwrap();
        assert_eq!(decoded.shape(), &[0, 3]);
    }

    #[test]
    fn test_parse_header() {
        let header =
            parse_header(b"NAME=MUSE,HARDWARE=Muse2016,FS=256,DATA=ffffi,#CH=5,EXTRA=none")
                .unwrap();
        assert_eq!(header.name, "MUSE");
        assert_eq!(header.hardware, "Muse2016");
        assert_eq!(header.fs, 256.0);
        assert_eq!(header.data_format.len(), 5);
        assert_eq!(header.data_format[4], FormatCode::Int32);
        assert_eq!(header.channel_count, 5);
    }

    #[test]
    fn test_header_missing_key() {
        let err = parse_header(b"NAME=MUSE,HARDWARE=x,DATA=ff,#CH=2").unwrap_err();
        assert!(matches!(err, StreamError::Protocol(msg) if msg.contains("FS")));
    }

    #[test]
    fn test_parse_channel_names() {
        assert_eq!(
            parse_channel_names(b"TP9,AF7,AF8,TP10,STATUS"),
            vec!["TP9", "AF7", "AF8", "TP10", "STATUS"]
        );
    }

    #[test]
    fn test_length_prefix() {
        let frame = encode_frame(b"abc");
        assert_eq!(&frame[..4], &[0, 0, 0, 3]);
        assert_eq!(payload_length([0, 0, 1, 0]).unwrap(), 256);
        assert!(matches!(
            payload_length([0xFF, 0xFF, 0xFF, 0xFF]),
            Err(StreamError::Framing(_))
        ));
        assert!(matches!(
            payload_length([0x7F, 0xFF, 0xFF, 0xFF]),
            Err(StreamError::Framing(_))
        ));
    }

    #[test]
    fn test_trigger_range() {
        assert_eq!(Command::trigger(1).unwrap().as_byte(), 1);
        assert_eq!(Command::trigger(64).unwrap().as_byte(), 64);
        assert!(Command::trigger(0).is_err());
        assert!(Command::trigger(65).is_err());
    }
}
