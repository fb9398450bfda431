//! Session description and command line handed to the transcoder.

use castkit_common::config::EgressConfig;
use castkit_common::media::RtpCodecCapability;
use std::fmt::Write;
use std::path::Path;

/// Codecs accepted on one rendezvous address.
#[derive(Debug, Clone)]
pub struct RendezvousCodecs<'a> {
    pub codecs: &'a [RtpCodecCapability],
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// SDP describing the two kind-tagged rendezvous addresses the transcoder listens on.
pub fn session_description(ip: &str, video: &RendezvousCodecs<'_>, audio: &RendezvousCodecs<'_>) -> String {
    let mut sdp = String::new();
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 0 0 IN IP4 {ip}");
    let _ = writeln!(sdp, "s=castkit egress");
    let _ = writeln!(sdp, "c=IN IP4 {ip}");
    let _ = writeln!(sdp, "t=0 0");
    media_section(&mut sdp, "video", video);
    media_section(&mut sdp, "audio", audio);
    sdp
}

/// Payload type the engine assigns when consuming with these capabilities.
fn payload_type(index: usize, codec: &RtpCodecCapability) -> u8 {
    codec.preferred_payload_type.unwrap_or(96 + index as u8)
}

fn media_section(sdp: &mut String, media: &str, rendezvous: &RendezvousCodecs<'_>) {
    let formats = rendezvous
        .codecs
        .iter()
        .enumerate()
        .map(|(i, codec)| payload_type(i, codec).to_string())
        .collect::<Vec<_>>()
        .join(" ");

    let _ = writeln!(sdp, "m={media} {} RTP/AVP {formats}", rendezvous.rtp_port);
    let _ = writeln!(sdp, "a=rtcp:{}", rendezvous.rtcp_port);
    for (i, codec) in rendezvous.codecs.iter().enumerate() {
        let pt = payload_type(i, codec);
        let name = codec.codec_name();
        match codec.channels {
            Some(channels) if channels > 1 => {
                let _ = writeln!(sdp, "a=rtpmap:{pt} {name}/{}/{channels}", codec.clock_rate);
            }
            _ => {
                let _ = writeln!(sdp, "a=rtpmap:{pt} {name}/{}", codec.clock_rate);
            }
        }
        if !codec.parameters.is_empty() {
            let fmtp = codec
                .parameters
                .iter()
                .map(|(key, value)| match value.as_str() {
                    Some(s) => format!("{key}={s}"),
                    None => format!("{key}={value}"),
                })
                .collect::<Vec<_>>()
                .join(";");
            let _ = writeln!(sdp, "a=fmtp:{pt} {fmtp}");
        }
    }
    let _ = writeln!(sdp, "a=sendonly");
}

/// Arguments for an ffmpeg-compatible transcoder reading `sdp_path` and
/// writing a rotating HLS playlist into the output directory.
pub fn ffmpeg_args(config: &EgressConfig) -> Vec<String> {
    let output_dir = Path::new(&config.output_dir);
    let segments = output_dir.join("segment_%05d.ts");
    let playlist = output_dir.join(&config.playlist);

    [
        "-hide_banner",
        "-loglevel",
        "warning",
        "-protocol_whitelist",
        "file,udp,rtp",
        "-fflags",
        "+genpts",
        "-i",
        config.sdp_path.as_str(),
        "-map",
        "0:v?",
        "-map",
        "0:a?",
        "-c:v",
        config.video_encoder.as_str(),
        "-preset",
        "veryfast",
        "-tune",
        "zerolatency",
        "-c:a",
        config.audio_encoder.as_str(),
        "-ar",
        "48000",
        "-ac",
        "2",
        "-f",
        "hls",
        "-hls_time",
    ]
    .into_iter()
    .map(str::to_owned)
    .chain([
        config.segment_secs.to_string(),
        "-hls_list_size".to_owned(),
        config.list_size.to_string(),
        "-hls_flags".to_owned(),
        "delete_segments".to_owned(),
        "-hls_segment_filename".to_owned(),
        segments.to_string_lossy().into_owned(),
        playlist.to_string_lossy().into_owned(),
    ])
    .collect()
}
