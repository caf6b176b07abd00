//! Frame sampling rule

/// Roughly one sample every 8 seconds at 30 fps.
pub const DEFAULT_INTERVAL_FRAMES: u64 = 240;

/// Whether `frame_index` is selected for analysis. An interval of 0 never samples.
pub fn should_analyze(frame_index: u64, interval_frames: u64) -> bool {
    interval_frames != 0 && frame_index % interval_frames == 0
}
