//! Pipeline construction configuration.

/// Configuration for a [`crate::PipelinePlayer`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Whether the native audio sink should be preferred over a generic
    /// one, when present in the plugin registry.
    pub native_audio: bool,
    /// Whether native video rendering is enabled.
    pub native_video: bool,
    /// Period of the position-report timer while `PLAYING`.
    pub position_report_period_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            native_audio: true,
            native_video: true,
            position_report_period_ms: 250,
        }
    }
}
