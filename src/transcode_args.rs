//! Pure builder turning `(backend, codec, surround, bitrate, output_kind)`
//! into an ffmpeg argv. No I/O, no process spawning — callers pass the
//! result to [`crate::process::spawn`].

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Software,
    Qsv,
    Nvenc,
    Vaapi,
}

impl Backend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "software" => Some(Backend::Software),
            "qsv" => Some(Backend::Qsv),
            "nvenc" => Some(Backend::Nvenc),
            "vaapi" => Some(Backend::Vaapi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Hevc,
    Av1,
}

impl Codec {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Some(Codec::H264),
            "hevc" => Some(Codec::Hevc),
            "av1" => Some(Codec::Av1),
            _ => None,
        }
    }

    /// Content-Type a caller should set on the HTTP response for a `Pipe`
    /// output of this codec.
    pub fn content_type(self) -> &'static str {
        match self {
            Codec::Av1 => "video/webm",
            Codec::H264 | Codec::Hevc => "video/mp2t",
        }
    }
}

#[derive(Debug, Clone)]
pub enum OutputKind {
    /// Stream container muxed straight to stdout (`pipe:1`).
    Pipe,
    /// Segment to disk as an HLS playlist + `seg_%05d.ts` files rooted at
    /// `dir`, with `playlist` naming the `.m3u8` file inside it.
    Hls { dir: std::path::PathBuf, playlist: std::path::PathBuf },
}

#[derive(Debug, Clone)]
pub struct TranscodeParams {
    pub backend: Backend,
    pub codec: Codec,
    pub surround: bool,
    /// Caller-requested video bitrate ceiling in kbit/s. `None` falls back
    /// to the backend/codec's default CRF-based quality target.
    pub bitrate_kbps: Option<u32>,
    pub output: OutputKind,
}

/// Build the ffmpeg argv for `params`, reading the capture's transport
/// stream from stdin (`pipe:0`). Encoder selection and the hardware-specific
/// input flags follow the backend/codec matrix; audio encoder and container
/// follow the codec (AV1 → WebM/Opus, H.264/HEVC → MPEG-TS/AAC for `Pipe`
/// output, or the `hls` muxer for `Hls` output).
pub fn build_ffmpeg_args(params: &TranscodeParams) -> Vec<String> {
    let mut argv: Vec<String> = Vec::with_capacity(40);
    let mut push = |s: &str| argv.push(s.to_string());

    push("-hide_banner");
    push("-loglevel");
    push("error");

    match params.backend {
        Backend::Qsv => {
            push("-hwaccel");
            push("qsv");
            push("-hwaccel_output_format");
            push("qsv");
        }
        Backend::Nvenc => {
            push("-hwaccel");
            push("cuda");
            push("-hwaccel_output_format");
            push("cuda");
        }
        Backend::Vaapi => {
            push("-hwaccel");
            push("vaapi");
            push("-hwaccel_device");
            push("/dev/dri/renderD128");
            push("-hwaccel_output_format");
            push("vaapi");
        }
        Backend::Software => {}
    }

    push("-fflags");
    push("+genpts+discardcorrupt+igndts");
    push("-err_detect");
    push("ignore_err");
    push("-probesize");
    push("5M");
    push("-analyzeduration");
    push("5M");

    push("-i");
    push("pipe:0");

    if params.backend == Backend::Qsv && params.codec == Codec::H264 {
        push("-vf");
        push("vpp_qsv=deinterlace=2");
    }

    push("-c:v");
    match (params.backend, params.codec) {
        (Backend::Software, Codec::H264) => {
            push("libx264");
            push_quality(&mut argv, params.bitrate_kbps, "veryfast", "23");
        }
        (Backend::Software, Codec::Hevc) => {
            push("libx265");
            push_quality(&mut argv, params.bitrate_kbps, "veryfast", "28");
        }
        (Backend::Software, Codec::Av1) => {
            push("libsvtav1");
            push_quality(&mut argv, params.bitrate_kbps, "8", "30");
        }
        (Backend::Qsv, Codec::H264) => push_hw_encoder(&mut argv, "h264_qsv", params.bitrate_kbps, "veryfast"),
        (Backend::Qsv, Codec::Hevc) => push_hw_encoder(&mut argv, "hevc_qsv", params.bitrate_kbps, "veryfast"),
        (Backend::Qsv, Codec::Av1) => push_hw_encoder(&mut argv, "av1_qsv", params.bitrate_kbps, "veryfast"),
        (Backend::Nvenc, Codec::H264) => push_hw_encoder(&mut argv, "h264_nvenc", params.bitrate_kbps, "p4"),
        (Backend::Nvenc, Codec::Hevc) => push_hw_encoder(&mut argv, "hevc_nvenc", params.bitrate_kbps, "p4"),
        (Backend::Nvenc, Codec::Av1) => push_hw_encoder(&mut argv, "av1_nvenc", params.bitrate_kbps, "p4"),
        (Backend::Vaapi, Codec::H264) => push_vaapi_encoder(&mut argv, "h264_vaapi", params.bitrate_kbps),
        (Backend::Vaapi, Codec::Hevc) => push_vaapi_encoder(&mut argv, "hevc_vaapi", params.bitrate_kbps),
        (Backend::Vaapi, Codec::Av1) => push_vaapi_encoder(&mut argv, "av1_vaapi", params.bitrate_kbps),
    }

    if params.codec == Codec::Av1 {
        if params.surround {
            argv.push("-af".into());
            argv.push("channelmap=channel_layout=5.1".into());
            argv.push("-c:a".into());
            argv.push("libopus".into());
            argv.push("-mapping_family".into());
            argv.push("1".into());
            argv.push("-b:a".into());
            argv.push("256k".into());
        } else {
            argv.push("-ac".into());
            argv.push("2".into());
            argv.push("-c:a".into());
            argv.push("libopus".into());
            argv.push("-b:a".into());
            argv.push("128k".into());
        }
    } else if params.surround {
        argv.push("-af".into());
        argv.push("channelmap=channel_layout=5.1".into());
        argv.push("-c:a".into());
        argv.push("aac".into());
        argv.push("-b:a".into());
        argv.push("384k".into());
    } else {
        argv.push("-ac".into());
        argv.push("2".into());
        argv.push("-c:a".into());
        argv.push("aac".into());
        argv.push("-b:a".into());
        argv.push("128k".into());
    }

    match &params.output {
        OutputKind::Pipe => {
            argv.push("-f".into());
            if params.codec == Codec::Av1 {
                argv.push("webm".into());
            } else {
                argv.push("mpegts".into());
            }
            argv.push("pipe:1".into());
        }
        OutputKind::Hls { dir, playlist } => {
            argv.push("-mpegts_flags".into());
            argv.push("+resend_headers".into());
            argv.push("-f".into());
            argv.push("hls".into());
            argv.push("-hls_time".into());
            argv.push("2".into());
            argv.push("-hls_list_size".into());
            argv.push("10".into());
            argv.push("-hls_flags".into());
            argv.push("delete_segments+independent_segments".into());
            argv.push("-hls_segment_filename".into());
            argv.push(seg_pattern(dir));
            argv.push(playlist.to_string_lossy().to_string());
        }
    }

    argv
}

fn seg_pattern(dir: &Path) -> String {
    dir.join("seg_%05d.ts").to_string_lossy().to_string()
}

fn push_quality(argv: &mut Vec<String>, bitrate_kbps: Option<u32>, preset: &str, default_crf: &str) {
    argv.push("-preset".into());
    argv.push(preset.to_string());
    match bitrate_kbps {
        Some(kbps) => {
            argv.push("-b:v".into());
            argv.push(format!("{kbps}k"));
            argv.push("-maxrate".into());
            argv.push(format!("{kbps}k"));
            argv.push("-bufsize".into());
            argv.push(format!("{}k", kbps * 2));
        }
        None => {
            argv.push("-crf".into());
            argv.push(default_crf.to_string());
        }
    }
}

fn push_hw_encoder(argv: &mut Vec<String>, encoder: &str, bitrate_kbps: Option<u32>, preset: &str) {
    argv.push(encoder.to_string());
    argv.push("-preset".into());
    argv.push(preset.to_string());
    if let Some(kbps) = bitrate_kbps {
        argv.push("-b:v".into());
        argv.push(format!("{kbps}k"));
    }
}

fn push_vaapi_encoder(argv: &mut Vec<String>, encoder: &str, bitrate_kbps: Option<u32>) {
    argv.push(encoder.to_string());
    if let Some(kbps) = bitrate_kbps {
        argv.push("-b:v".into());
        argv.push(format!("{kbps}k"));
    }
}
