//! Opus codec tuning over SDP session descriptions
//!
//! [`tune`] is a pure transform over local offers/answers: it locates the
//! Opus payload in the codec map and pins its format parameters to the fixed
//! targets from [`OpusTuning`]. Remote descriptions are never tuned — only
//! what we send is rewritten. Tuning is best-effort: a description without an
//! Opus rtpmap line passes through unchanged.

use crate::config::OpusTuning;

/// Locate the Opus payload type by scanning `a=rtpmap:` codec-map lines
fn find_opus_payload(sdp: &str) -> Option<u8> {
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            if let Some((pt, codec)) = rest.split_once(' ') {
                if codec.to_ascii_lowercase().starts_with("opus/") {
                    return pt.trim().parse().ok();
                }
            }
        }
    }
    None
}

/// Whether a line is the fmtp attribute for the given payload type
fn is_fmtp_for(line: &str, pt: u8) -> bool {
    line.strip_prefix("a=fmtp:")
        .and_then(|rest| rest.split(' ').next())
        .is_some_and(|p| p == pt.to_string())
}

/// Render the fixed fmtp parameter list
///
/// Parameter order is deterministic so that re-tuning an already-tuned
/// description is a no-op.
fn fmtp_params(t: &OpusTuning) -> String {
    format!(
        "minptime={};maxptime={};stereo={};sprop-stereo={};useinbandfec={};cbr={};maxaveragebitrate={};maxplaybackrate={}",
        t.min_ptime_ms,
        t.max_ptime_ms,
        u8::from(t.stereo),
        u8::from(t.stereo),
        u8::from(t.fec),
        u8::from(t.cbr),
        t.max_average_bitrate,
        t.max_playback_rate,
    )
}

/// Rewrite the Opus format parameters of a local session description
///
/// Replaces (or inserts) the `a=fmtp:` line for the Opus payload with the
/// fixed targets and inserts an `a=ptime:` directive if the audio media
/// section lacks one. Line endings of the input are preserved.
pub fn tune(sdp: &str, tuning: &OpusTuning) -> String {
    let Some(pt) = find_opus_payload(sdp) else {
        return sdp.to_string();
    };

    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = sdp.lines().collect();

    let rtpmap_prefix = format!("a=rtpmap:{pt} ");
    let Some(rtpmap_idx) = lines.iter().position(|l| l.starts_with(&rtpmap_prefix)) else {
        return sdp.to_string();
    };

    // Bound the media section carrying the Opus payload; ptime and fmtp
    // rewrites must not leak into other sections.
    let section_start = lines[..rtpmap_idx]
        .iter()
        .rposition(|l| l.starts_with("m="))
        .unwrap_or(0);
    let section_end = lines[rtpmap_idx..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map_or(lines.len(), |i| rtpmap_idx + i);

    let section = &lines[section_start..section_end];
    let has_ptime = section.iter().any(|l| l.starts_with("a=ptime:"));
    let has_fmtp = section.iter().any(|l| is_fmtp_for(l, pt));

    let fmtp_line = format!("a=fmtp:{pt} {}", fmtp_params(tuning));

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 2);
    for (i, line) in lines.iter().enumerate() {
        if i >= section_start && i < section_end && is_fmtp_for(line, pt) {
            out.push(fmtp_line.clone());
            continue;
        }
        out.push((*line).to_string());
        if i == rtpmap_idx {
            if !has_fmtp {
                out.push(fmtp_line.clone());
            }
            if !has_ptime {
                out.push(format!("a=ptime:{}", tuning.ptime_ms));
            }
        }
    }

    let mut result = out.join(newline);
    if sdp.ends_with('\n') {
        result.push_str(newline);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUDIO_OFFER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 103\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:0\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=rtpmap:103 ISAC/16000\r\n";

    const VIDEO_ONLY: &str = "v=0\r\n\
        o=- 1 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=rtpmap:96 VP8/90000\r\n";

    #[test]
    fn test_finds_opus_payload() {
        assert_eq!(find_opus_payload(AUDIO_OFFER), Some(111));
        assert_eq!(find_opus_payload(VIDEO_ONLY), None);
    }

    #[test]
    fn test_no_opus_is_identity() {
        let tuned = tune(VIDEO_ONLY, &OpusTuning::default());
        assert_eq!(tuned, VIDEO_ONLY);
    }

    #[test]
    fn test_rewrites_fmtp_parameters() {
        let tuned = tune(AUDIO_OFFER, &OpusTuning::default());
        assert!(tuned.contains("a=fmtp:111 minptime=10;maxptime=60;stereo=1;sprop-stereo=1;useinbandfec=1;cbr=0;maxaveragebitrate=64000;maxplaybackrate=48000"));
        // The original fmtp line is replaced, not duplicated
        assert_eq!(tuned.matches("a=fmtp:111").count(), 1);
        // Other codecs are untouched
        assert!(tuned.contains("a=rtpmap:103 ISAC/16000"));
    }

    #[test]
    fn test_inserts_missing_fmtp() {
        let offer = AUDIO_OFFER.replace("a=fmtp:111 minptime=10;useinbandfec=1\r\n", "");
        let tuned = tune(&offer, &OpusTuning::default());
        assert_eq!(tuned.matches("a=fmtp:111").count(), 1);
        assert!(tuned.contains("maxaveragebitrate=64000"));
    }

    #[test]
    fn test_inserts_ptime_once() {
        let tuned = tune(AUDIO_OFFER, &OpusTuning::default());
        assert_eq!(tuned.matches("a=ptime:20").count(), 1);

        let with_ptime = AUDIO_OFFER.replace("a=mid:0\r\n", "a=mid:0\r\na=ptime:10\r\n");
        let tuned = tune(&with_ptime, &OpusTuning::default());
        // An existing directive wins; no second ptime appears
        assert!(tuned.contains("a=ptime:10"));
        assert!(!tuned.contains("a=ptime:20"));
    }

    #[test]
    fn test_tune_is_idempotent() {
        let tuning = OpusTuning::default();
        let once = tune(AUDIO_OFFER, &tuning);
        let twice = tune(&once, &tuning);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_codec_name_case_insensitive() {
        let offer = AUDIO_OFFER.replace("opus/48000/2", "OPUS/48000/2");
        assert_eq!(find_opus_payload(&offer), Some(111));
    }

    #[test]
    fn test_preserves_line_endings() {
        let unix = AUDIO_OFFER.replace("\r\n", "\n");
        let tuned = tune(&unix, &OpusTuning::default());
        assert!(!tuned.contains('\r'));
        assert!(tuned.ends_with('\n'));
    }

    #[test]
    fn test_custom_targets() {
        let tuning = OpusTuning {
            max_average_bitrate: 128_000,
            stereo: false,
            ..OpusTuning::default()
        };
        let tuned = tune(AUDIO_OFFER, &tuning);
        assert!(tuned.contains("maxaveragebitrate=128000"));
        assert!(tuned.contains("stereo=0;sprop-stereo=0"));
    }
}
