//! `getSupportedMimeTypes`/`isMimeTypeSupported`: a static capability
//! table. Grounded in `IMediaPipelineCapabilities.h` — the introspection
//! surface `attachSource`'s mime-type validation draws on, not a live
//! query of installed decoder plugins (out of scope here).

use rialto_shared_types::SourceType;

const AUDIO_MIME_TYPES: &[&str] = &["audio/mpeg", "audio/mp4", "audio/x-opus", "audio/x-raw"];
const VIDEO_MIME_TYPES: &[&str] = &["video/mp4", "video/h264", "video/h265", "video/x-vp9"];
const SUBTITLE_MIME_TYPES: &[&str] = &["text/vtt", "text/ttml"];

/// `getSupportedMimeTypes(sourceType)`.
pub fn supported_mime_types(source_type: SourceType) -> Vec<String> {
    let table: &[&str] = match source_type {
        SourceType::Audio => AUDIO_MIME_TYPES,
        SourceType::Video => VIDEO_MIME_TYPES,
        SourceType::Subtitle => SUBTITLE_MIME_TYPES,
    };
    table.iter().map(|&s| s.to_string()).collect()
}

/// `isMimeTypeSupported(mimeType)`.
pub fn is_mime_type_supported(mime_type: &str) -> bool {
    AUDIO_MIME_TYPES.contains(&mime_type) || VIDEO_MIME_TYPES.contains(&mime_type) || SUBTITLE_MIME_TYPES.contains(&mime_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_mpeg_is_supported_but_unknown_mime_is_not() {
        assert!(is_mime_type_supported("audio/mpeg"));
        assert!(!is_mime_type_supported("application/x-nonsense"));
    }

    #[test]
    fn supported_mime_types_are_scoped_to_their_source_type() {
        let audio = supported_mime_types(SourceType::Audio);
        assert!(audio.iter().any(|m| m == "audio/mpeg"));
        assert!(!audio.iter().any(|m| m == "video/mp4"));
    }
}
