use nom::bytes::complete::take;
use nom::number::complete::{be_u16, u8 as any_u8};
use nom::IResult;

use crate::error::Error;

pub const STATUS_FRAME_LEN: usize = 21;
pub const CONFIG_FRAME_LEN: usize = 16;

/// Uplink timeout word: bit 15 flags panic, low 15 bits carry the
/// remaining manual-override minutes.
const PANIC_BIT: u16 = 0x8000;

/// A status frame as reported by a controller, before calibration.
///
/// All level values are in raw sensor units (one byte per channel); the
/// calibration transform turns them into centimeters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawStatus {
    pub panic: bool,
    /// Remaining manual-override minutes; 0 means automatic control.
    pub manual_timeout: u16,
    pub pump: [bool; 4],
    pub flow_in: u8,
    pub flow_out: u8,
    pub target_flow: u8,
    pub current_level: [u8; 3],
    pub target_level: [u8; 3],
    pub min_level: [u8; 3],
    pub max_level: [u8; 3],
}

fn level_triple(input: &[u8]) -> IResult<&[u8], [u8; 3]> {
    let (input, bytes) = take(3usize)(input)?;
    Ok((input, [bytes[0], bytes[1], bytes[2]]))
}

fn parse_status(input: &[u8]) -> IResult<&[u8], RawStatus> {
    let (input, timeout_word) = be_u16(input)?;
    let (input, pumps) = take(4usize)(input)?;
    let (input, flow_in) = any_u8(input)?;
    let (input, flow_out) = any_u8(input)?;
    let (input, target_flow) = any_u8(input)?;
    let (input, current_level) = level_triple(input)?;
    let (input, target_level) = level_triple(input)?;
    let (input, min_level) = level_triple(input)?;
    let (input, max_level) = level_triple(input)?;

    let panic = timeout_word & PANIC_BIT != 0;

    Ok((
        input,
        RawStatus {
            panic,
            // a panicking controller has given up its manual override
            manual_timeout: if panic { 0 } else { timeout_word & !PANIC_BIT },
            pump: [
                pumps[0] != 0,
                pumps[1] != 0,
                pumps[2] != 0,
                pumps[3] != 0,
            ],
            flow_in,
            flow_out,
            target_flow,
            current_level,
            target_level,
            min_level,
            max_level,
        },
    ))
}

/// Decode a 21-byte status frame. Trailing bytes are ignored; a short
/// frame is a `MalformedFrame` error. Byte values cannot be out of
/// range, so this is the only failure mode.
pub fn decode_status(frame: &[u8]) -> Result<RawStatus, Error> {
    match parse_status(frame) {
        Ok((_, status)) => Ok(status),
        Err(_) => Err(Error::MalformedFrame(format!(
            "status frame is {} bytes, need {}",
            frame.len(),
            STATUS_FRAME_LEN
        ))),
    }
}

/// Encode a 16-byte config frame for the downlink path.
///
/// The timeout is a plain big-endian u16 here; the panic-bit convention
/// only exists on uplinks. Raw level values must already have been
/// clamped to the byte domain by the calibration transform.
pub fn encode_config(
    manual_timeout: u16,
    pump: &[bool; 4],
    target_flow: u8,
    target_level: &[u8; 3],
    min_level: &[u8; 3],
    max_level: &[u8; 3],
) -> [u8; CONFIG_FRAME_LEN] {
    let mut frame = [0u8; CONFIG_FRAME_LEN];

    frame[0..2].copy_from_slice(&manual_timeout.to_be_bytes());
    for (i, on) in pump.iter().enumerate() {
        frame[2 + i] = *on as u8;
    }
    frame[6] = target_flow;
    frame[7..10].copy_from_slice(target_level);
    frame[10..13].copy_from_slice(min_level);
    frame[13..16].copy_from_slice(max_level);

    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_frame() -> [u8; STATUS_FRAME_LEN] {
        [
            0x00, 0x0a, // 10 minutes manual timeout
            1, 0, 0, 1, // pumps
            7, 3, // flow in/out
            40, // target flow
            31, 45, 60, // current level
            30, 45, 60, // target level
            0, 0, 0, // min level
            80, 130, 180, // max level
        ]
    }

    #[test]
    fn decodes_status_layout() {
        let status = decode_status(&status_frame()).unwrap();

        assert!(!status.panic);
        assert_eq!(status.manual_timeout, 10);
        assert_eq!(status.pump, [true, false, false, true]);
        assert_eq!(status.flow_in, 7);
        assert_eq!(status.flow_out, 3);
        assert_eq!(status.target_flow, 40);
        assert_eq!(status.current_level, [31, 45, 60]);
        assert_eq!(status.target_level, [30, 45, 60]);
        assert_eq!(status.min_level, [0, 0, 0]);
        assert_eq!(status.max_level, [80, 130, 180]);
    }

    #[test]
    fn panic_bit_forces_timeout_to_zero() {
        let mut frame = status_frame();
        frame[0] = 0x80 | frame[0];

        let status = decode_status(&frame).unwrap();
        assert!(status.panic);
        assert_eq!(status.manual_timeout, 0);
    }

    #[test]
    fn fifteen_bit_timeout_survives() {
        let mut frame = status_frame();
        frame[0] = 0x7f;
        frame[1] = 0xff;

        let status = decode_status(&frame).unwrap();
        assert!(!status.panic);
        assert_eq!(status.manual_timeout, 0x7fff);
    }

    #[test]
    fn short_frame_is_malformed() {
        let frame = status_frame();
        assert!(matches!(
            decode_status(&frame[..20]),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(decode_status(&[]), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut long = status_frame().to_vec();
        long.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(decode_status(&long), decode_status(&status_frame()));
    }

    #[test]
    fn encodes_config_layout() {
        let frame = encode_config(
            300,
            &[true, false, false, true],
            40,
            &[30, 45, 60],
            &[0, 0, 0],
            &[80, 130, 180],
        );

        assert_eq!(frame[0], 0x01);
        assert_eq!(frame[1], 0x2c);
        assert_eq!(&frame[2..6], &[1, 0, 0, 1]);
        assert_eq!(frame[6], 40);
        assert_eq!(&frame[7..10], &[30, 45, 60]);
        assert_eq!(&frame[10..13], &[0, 0, 0]);
        assert_eq!(&frame[13..16], &[80, 130, 180]);
    }
}
