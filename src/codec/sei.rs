// src/codec/sei.rs - user_data_unregistered SEI read/write
//
// Payload framing: NAL header, payload type 0x05, payload size as a run
// of 0xFF bytes plus a final byte < 0xFF (the bytes sum to the size),
// the 16-byte application UUID, the content, and a 0x80 rbsp trailer.
// Annex-B output uses a 4-byte start code; AVCC output carries a 4-byte
// big-endian length prefix backfilled after the NAL body is written.

use bytes::Bytes;

use super::{find_start_code, is_annexb, nal_units};

/// Distinguishes this toolkit's SEI payloads from other emitters.
pub const SEI_UUID: [u8; 16] = [
    0x54, 0x80, 0x83, 0x97, 0xf0, 0x23, 0x47, 0x4b, 0xb7, 0xf7, 0x4f, 0x32, 0xb5, 0x4e, 0x06,
    0xac,
];

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const SEI_PAYLOAD_TYPE_USER_DATA: u8 = 5;

const NAL_TYPE_SEI_H264: u8 = 6;
const NAL_TYPE_SEI_PREFIX_H265: u8 = 39;
const NAL_TYPE_SEI_SUFFIX_H265: u8 = 40;

/// SEI NAL size for an H.264 payload of `content_len` bytes, excluding
/// the start code / length prefix.
pub fn sei_nal_size_h264(content_len: usize) -> usize {
    let payload = content_len + SEI_UUID.len();
    let size_field = payload / 0xFF + 1;
    // header + payload type + size field + payload + trailer
    1 + 1 + size_field + payload + 1
}

/// Total packet size produced by [`write_sei_h264`].
pub fn sei_packet_size_h264(content_len: usize) -> usize {
    sei_nal_size_h264(content_len) + 4
}

fn push_payload(out: &mut Vec<u8>, content: &[u8]) {
    out.push(SEI_PAYLOAD_TYPE_USER_DATA);
    let mut remaining = content.len() + SEI_UUID.len();
    while remaining >= 0xFF {
        out.push(0xFF);
        remaining -= 0xFF;
    }
    out.push(remaining as u8);
    out.extend_from_slice(&SEI_UUID);
    out.extend_from_slice(content);
    out.push(0x80);
}

fn backfill_avcc_length(out: &mut Vec<u8>) {
    let nal_len = (out.len() - 4) as u32;
    out[..4].copy_from_slice(&nal_len.to_be_bytes());
}

/// Encode `content` as an H.264 user-data SEI packet.
pub fn write_sei_h264(annexb: bool, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sei_packet_size_h264(content.len()));
    if annexb {
        out.extend_from_slice(&START_CODE);
    } else {
        out.extend_from_slice(&[0u8; 4]);
    }
    out.push(NAL_TYPE_SEI_H264);
    push_payload(&mut out, content);
    if !annexb {
        backfill_avcc_length(&mut out);
    }
    out
}

/// Encode `content` as an H.265 prefix-SEI packet.
pub fn write_sei_h265(annexb: bool, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(sei_packet_size_h264(content.len()) + 1);
    if annexb {
        out.extend_from_slice(&START_CODE);
    } else {
        out.extend_from_slice(&[0u8; 4]);
    }
    out.push(NAL_TYPE_SEI_PREFIX_H265 << 1);
    out.push(0x01);
    push_payload(&mut out, content);
    if !annexb {
        backfill_avcc_length(&mut out);
    }
    out
}

/// Parse an SEI body (starting at the payload-type field) and return the
/// UUID-tagged user payload, if present.
fn parse_sei_body(data: &[u8]) -> Option<Bytes> {
    let mut i = 0usize;
    let mut sei_type = 0usize;
    loop {
        let b = *data.get(i)?;
        sei_type += b as usize;
        i += 1;
        if b != 0xFF {
            break;
        }
    }
    let mut sei_size = 0usize;
    loop {
        let b = *data.get(i)?;
        sei_size += b as usize;
        i += 1;
        if b != 0xFF {
            break;
        }
    }

    if sei_type != SEI_PAYLOAD_TYPE_USER_DATA as usize {
        return None;
    }
    if sei_size < SEI_UUID.len() || i + sei_size > data.len() {
        return None;
    }
    if data[i..i + SEI_UUID.len()] != SEI_UUID {
        return None;
    }
    Some(Bytes::copy_from_slice(
        &data[i + SEI_UUID.len()..i + sei_size],
    ))
}

/// Locate this toolkit's SEI payload in an H.264 packet (Annex-B or
/// AVCC, auto-detected). `None` means no UUID-matching payload; this is
/// a predicate result, not an error.
///
/// In Annex-B framing the payload length comes from the SEI size field
/// rather than the next start code, so payloads containing start-code
/// byte patterns survive the round trip.
pub fn read_sei_h264(packet: &[u8]) -> Option<Bytes> {
    if is_annexb(packet) {
        let mut from = 0;
        while let Some((at, code_len)) = find_start_code(packet, from) {
            from = at + code_len;
            let nal = &packet[from..];
            match nal.first() {
                Some(header) if header & 0x1F == NAL_TYPE_SEI_H264 => {
                    if let Some(payload) = parse_sei_body(&nal[1..]) {
                        return Some(payload);
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
        None
    } else {
        for unit in nal_units(packet) {
            let Some(&header) = unit.first() else { continue };
            if header & 0x1F != NAL_TYPE_SEI_H264 {
                continue;
            }
            if let Some(payload) = parse_sei_body(&unit[1..]) {
                return Some(payload);
            }
        }
        None
    }
}

/// Locate this toolkit's SEI payload in an H.265 packet (Annex-B or
/// HVCC, auto-detected).
pub fn read_sei_h265(packet: &[u8]) -> Option<Bytes> {
    if is_annexb(packet) {
        let mut from = 0;
        while let Some((at, code_len)) = find_start_code(packet, from) {
            from = at + code_len;
            let nal = &packet[from..];
            if nal.len() < 3 {
                break;
            }
            let nal_type = (nal[0] >> 1) & 0x3F;
            if nal_type == NAL_TYPE_SEI_PREFIX_H265 || nal_type == NAL_TYPE_SEI_SUFFIX_H265 {
                // 2-byte HEVC NAL header.
                if let Some(payload) = parse_sei_body(&nal[2..]) {
                    return Some(payload);
                }
            }
        }
        None
    } else {
        for unit in nal_units(packet) {
            if unit.len() < 3 {
                continue;
            }
            let nal_type = (unit[0] >> 1) & 0x3F;
            if nal_type != NAL_TYPE_SEI_PREFIX_H265 && nal_type != NAL_TYPE_SEI_SUFFIX_H265 {
                continue;
            }
            if let Some(payload) = parse_sei_body(&unit[2..]) {
                return Some(payload);
            }
        }
        None
    }
}

/// Format-aware probe used by the decoder: tries the codec the stream
/// actually carries.
pub fn read_sei(h265: bool, packet: &[u8]) -> Option<Bytes> {
    if h265 {
        read_sei_h265(packet)
    } else {
        read_sei_h264(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_annexb_round_trip() {
        let payload = b"pipeline-metadata:42";
        let packet = write_sei_h264(true, payload);
        assert!(is_annexb(&packet));
        let got = read_sei_h264(&packet).expect("payload present");
        assert_eq!(&got[..], payload);
    }

    #[test]
    fn test_h264_avcc_round_trip_and_length_prefix() {
        let payload: Vec<u8> = (0..100u8).map(|i| i.wrapping_mul(37)).collect();
        let packet = write_sei_h264(false, &payload);
        // First 4 bytes carry the big-endian NAL length (prefix excluded).
        let prefix = u32::from_be_bytes(packet[..4].try_into().unwrap()) as usize;
        assert_eq!(prefix, packet.len() - 4);
        assert_eq!(packet.len(), sei_packet_size_h264(payload.len()));

        let got = read_sei_h264(&packet).expect("payload present");
        assert_eq!(got.len(), 100);
        assert_eq!(&got[..], &payload[..]);
    }

    #[test]
    fn test_h265_round_trip_both_framings() {
        let payload = vec![0xA5u8; 300];
        for annexb in [true, false] {
            let packet = write_sei_h265(annexb, &payload);
            let got = read_sei_h265(&packet).expect("payload present");
            assert_eq!(&got[..], &payload[..]);
        }
    }

    #[test]
    fn test_payload_size_ff_run_encoding() {
        // 239 content bytes + 16 UUID = 255: encoded as FF 00.
        let payload = vec![1u8; 239];
        let packet = write_sei_h264(true, &payload);
        // start code(4) + header(1) + type(1), then the size run
        assert_eq!(packet[6], 0xFF);
        assert_eq!(packet[7], 0x00);
        let got = read_sei_h264(&packet).expect("payload present");
        assert_eq!(got.len(), 239);
    }

    #[test]
    fn test_large_payload_round_trip() {
        let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
        for annexb in [true, false] {
            let packet = write_sei_h264(annexb, &payload);
            let got = read_sei_h264(&packet).expect("payload present");
            assert_eq!(&got[..], &payload[..]);
        }
    }

    #[test]
    fn test_annexb_payload_with_embedded_start_codes() {
        let payload = [0x41, 0x00, 0x00, 0x01, 0x42, 0x00, 0x00, 0x00, 0x01, 0x43];
        let packet = write_sei_h264(true, &payload);
        let got = read_sei_h264(&packet).expect("payload present");
        assert_eq!(&got[..], &payload[..]);
    }

    #[test]
    fn test_foreign_uuid_not_found() {
        let mut packet = write_sei_h264(true, b"hello");
        // Corrupt one UUID byte: start(4) + header(1) + type(1) + size(1).
        packet[7] ^= 0xFF;
        assert!(read_sei_h264(&packet).is_none());
    }

    #[test]
    fn test_non_sei_nals_are_skipped() {
        // SPS + IDR, then the SEI.
        let mut data = vec![0, 0, 0, 1, 0x67, 0x64, 0x00];
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x80]);
        data.extend_from_slice(&write_sei_h264(true, b"tail"));
        let got = read_sei_h264(&data).expect("payload present");
        assert_eq!(&got[..], b"tail");
    }

    #[test]
    fn test_not_found_in_plain_video_packet() {
        let data = vec![0, 0, 0, 1, 0x65, 0x88, 0x80, 0x10];
        assert!(read_sei_h264(&data).is_none());
        assert!(read_sei_h265(&data).is_none());
    }

    #[test]
    fn test_empty_input() {
        assert!(read_sei_h264(&[]).is_none());
        assert!(read_sei_h265(&[]).is_none());
    }

    #[test]
    fn test_nal_size_matches_layout() {
        // 10 + 16 = 26 payload bytes, 1-byte size field.
        assert_eq!(sei_nal_size_h264(10), 1 + 1 + 1 + 26 + 1);
        // 239 + 16 = 255, 2-byte size field.
        assert_eq!(sei_nal_size_h264(239), 1 + 1 + 2 + 255 + 1);
        assert_eq!(sei_packet_size_h264(10), sei_nal_size_h264(10) + 4);
    }
}
