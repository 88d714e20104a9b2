use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_VP8};

/// Map a verbal codec name to the wire MIME type for the video track.
///
/// Unknown names fall back to VP8, which every browser answers.
pub fn video_mime(codec: &str) -> &'static str {
    match codec {
        "h264" => MIME_TYPE_H264,
        "vpx" => MIME_TYPE_VP8,
        _ => MIME_TYPE_VP8,
    }
}
