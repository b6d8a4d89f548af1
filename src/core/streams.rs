//! Well-known stream names and the metastream naming rule.

/// Stream holding scavenge point markers.
pub const SCAVENGES_STREAM: &str = "$scavenges";

const METASTREAM_PREFIX: &str = "$$";

/// Whether `stream_id` is a metastream (`$$<name>`).
pub fn is_metastream(stream_id: &str) -> bool {
    stream_id.starts_with(METASTREAM_PREFIX)
}

/// The metastream carrying retention metadata for `stream_id`.
pub fn metastream_of(stream_id: &str) -> String {
    format!("{METASTREAM_PREFIX}{stream_id}")
}

/// The original stream a metastream belongs to. Returns `None` when
/// `stream_id` is not a metastream.
pub fn original_stream_of(stream_id: &str) -> Option<&str> {
    stream_id.strip_prefix(METASTREAM_PREFIX)
}
