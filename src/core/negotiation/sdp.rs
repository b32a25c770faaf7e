//! Session description rewriting applied before every local commit.
//!
//! Transforms run in a fixed order: strip the H.264 preference that some
//! remote stacks reject, enable Opus stereo, then cap bandwidth per media
//! section.

use crate::core::config::{Bandwidth, NegotiatorSettings};

const H264_INCOMPATIBLE_PROFILE: &str = "profile-level-id=0x42e00c";

pub fn transform(sdp: &str, settings: &NegotiatorSettings) -> String {
    let mut lines: Vec<String> = sdp.lines().map(str::to_string).collect();
    lines = strip_h264_preference(lines);
    if settings.stereo {
        lines = enable_opus_stereo(lines);
    }
    if !settings.bandwidth.is_empty() {
        lines = apply_bandwidth(lines, &settings.bandwidth);
    }

    let mut out = lines.join("\r\n");
    if sdp.ends_with('\n') {
        out.push_str("\r\n");
    }
    out
}

pub fn strip_h264_preference(lines: Vec<String>) -> Vec<String> {
    lines
        .into_iter()
        .filter(|line| !(line.starts_with("a=fmtp:") && line.contains(H264_INCOMPATIBLE_PROFILE)))
        .collect()
}

fn opus_payload_type(lines: &[String]) -> Option<(usize, String)> {
    lines.iter().enumerate().find_map(|(i, line)| {
        let rest = line.strip_prefix("a=rtpmap:")?;
        let (pt, codec) = rest.split_once(' ')?;
        codec
            .to_ascii_lowercase()
            .starts_with("opus/48000")
            .then(|| (i, pt.to_string()))
    })
}

pub fn enable_opus_stereo(mut lines: Vec<String>) -> Vec<String> {
    let Some((rtpmap_index, pt)) = opus_payload_type(&lines) else {
        return lines;
    };

    let fmtp_prefix = format!("a=fmtp:{pt} ");
    match lines.iter_mut().find(|line| line.starts_with(&fmtp_prefix)) {
        Some(line) if line.contains("stereo=1") => {}
        Some(line) => line.push_str(";stereo=1"),
        None => lines.insert(rtpmap_index + 1, format!("{fmtp_prefix}stereo=1")),
    }
    lines
}

fn section_cap(media_line: &str, bandwidth: &Bandwidth) -> Option<u32> {
    let media = media_line.strip_prefix("m=")?.split(' ').next()?;
    match media {
        "audio" => bandwidth.audio,
        "video" => bandwidth.video,
        "application" => bandwidth.data,
        _ => None,
    }
}

/// Write `b=AS:<kbps>` into each capped media section, after its `m=`,
/// `i=` and `c=` lines, replacing any `b=AS` already there.
pub fn apply_bandwidth(lines: Vec<String>, bandwidth: &Bandwidth) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len() + 3);
    let mut cap: Option<u32> = None;
    let mut pending = false;

    for line in lines {
        if line.starts_with("m=") {
            if let (true, Some(kbps)) = (pending, cap) {
                out.push(format!("b=AS:{kbps}"));
            }
            cap = section_cap(&line, bandwidth);
            pending = cap.is_some();
            out.push(line);
            continue;
        }

        if cap.is_some() && line.starts_with("b=AS:") {
            continue;
        }
        if pending && !(line.starts_with("i=") || line.starts_with("c=")) {
            if let Some(kbps) = cap {
                out.push(format!("b=AS:{kbps}"));
            }
            pending = false;
        }
        out.push(line);
    }
    if let (true, Some(kbps)) = (pending, cap) {
        out.push(format!("b=AS:{kbps}"));
    }
    out
}
