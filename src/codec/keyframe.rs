// src/codec/keyframe.rs - Access-point classification by NAL scan
//
// Walks every NAL unit of the packet instead of trusting a fixed byte
// offset, so SEI/SPS/PPS prefixes and either framing are handled.

use super::nal_units;

const H264_NAL_IDR: u8 = 5;
const H264_NAL_SEI: u8 = 6;
const H264_NAL_SPS: u8 = 7;
const H264_NAL_PPS: u8 = 8;

const H265_NAL_IDR_W_RADL: u8 = 19;
const H265_NAL_IDR_N_LP: u8 = 20;
const H265_NAL_CRA: u8 = 21;
const H265_NAL_SEI_PREFIX: u8 = 39;
const H265_NAL_SEI_SUFFIX: u8 = 40;

/// True when the H.264 packet contains an IDR NAL (type 5), in either
/// Annex-B or AVCC framing. SEI/SPS/PPS units are skipped, any other
/// slice type does not decide.
pub fn is_keyframe_h264(packet: &[u8]) -> bool {
    for unit in nal_units(packet) {
        let Some(&header) = unit.first() else { continue };
        match header & 0x1F {
            H264_NAL_SEI | H264_NAL_SPS | H264_NAL_PPS => continue,
            H264_NAL_IDR => return true,
            _ => continue,
        }
    }
    false
}

/// True when the H.265 packet contains an IDR_W_RADL(19), IDR_N_LP(20)
/// or CRA(21) NAL. SEI units (39/40) are skipped.
pub fn is_keyframe_h265(packet: &[u8]) -> bool {
    for unit in nal_units(packet) {
        if unit.len() < 2 {
            continue;
        }
        let nal_type = (unit[0] >> 1) & 0x3F;
        match nal_type {
            H265_NAL_SEI_PREFIX | H265_NAL_SEI_SUFFIX => continue,
            H265_NAL_IDR_W_RADL | H265_NAL_IDR_N_LP | H265_NAL_CRA => return true,
            _ => continue,
        }
    }
    false
}

/// Codec families the classifier can inspect at the byte level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Other,
}

/// Classify an access point. For codecs without a byte-level scanner
/// the demuxer-reported key flag decides.
pub fn is_keyframe(codec: VideoCodec, packet: &[u8], demuxer_key_flag: bool) -> bool {
    match codec {
        VideoCodec::H264 => is_keyframe_h264(packet),
        VideoCodec::H265 => is_keyframe_h265(packet),
        VideoCodec::Other => demuxer_key_flag,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(unit);
        }
        out
    }

    fn avcc(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out
    }

    #[test]
    fn test_h264_idr_after_parameter_sets() {
        let packet = annexb(&[
            &[0x67, 0x64, 0x00], // SPS
            &[0x68, 0xEE],       // PPS
            &[0x06, 0x05, 0x01], // SEI
            &[0x65, 0x88, 0x84], // IDR
        ]);
        assert!(is_keyframe_h264(&packet));
    }

    #[test]
    fn test_h264_parameter_sets_only_is_not_key() {
        let packet = annexb(&[&[0x06, 0x05, 0x01], &[0x67, 0x64], &[0x68, 0xEE]]);
        assert!(!is_keyframe_h264(&packet));
    }

    #[test]
    fn test_h264_non_idr_slice_is_not_key() {
        let packet = annexb(&[&[0x41, 0x9A, 0x00]]); // P slice, type 1
        assert!(!is_keyframe_h264(&packet));
    }

    #[test]
    fn test_h264_avcc_framing() {
        let packet = avcc(&[&[0x67, 0x64], &[0x65, 0x88]]);
        assert!(is_keyframe_h264(&packet));
        let packet = avcc(&[&[0x41, 0x9A]]);
        assert!(!is_keyframe_h264(&packet));
    }

    #[test]
    fn test_h265_idr_and_cra_types() {
        for nal_type in [19u8, 20, 21] {
            let packet = avcc(&[&[nal_type << 1, 0x01, 0x00]]);
            assert!(is_keyframe_h265(&packet), "type {nal_type}");
        }
        // TRAIL_R (type 1) is not a key.
        let packet = avcc(&[&[1 << 1, 0x01, 0x00]]);
        assert!(!is_keyframe_h265(&packet));
    }

    #[test]
    fn test_h265_sei_skipped() {
        let packet = annexb(&[
            &[39 << 1, 0x01, 0x05],       // prefix SEI
            &[19 << 1, 0x01, 0xAF, 0x08], // IDR_W_RADL
        ]);
        assert!(is_keyframe_h265(&packet));
    }

    #[test]
    fn test_other_codec_uses_demuxer_flag() {
        assert!(is_keyframe(VideoCodec::Other, &[], true));
        assert!(!is_keyframe(VideoCodec::Other, &[], false));
        assert!(!is_keyframe(VideoCodec::H264, &[0, 0, 0, 1, 0x41, 0x00], true));
    }

    #[test]
    fn test_empty_packet() {
        assert!(!is_keyframe_h264(&[]));
        assert!(!is_keyframe_h265(&[]));
    }
}
