//! Best-effort parsing of the model's two-section answer
//!
//! Expected shape:
//!
//! ```text
//! 1. Available spaces: 5
//! 2. Recommended spots:
//! - Row A, near the entrance
//! - Row C, end spot
//! ```
//!
//! Missing or malformed sections fall back to defaults; parsing never fails.

use serde::{Deserialize, Serialize};

pub const AVAILABLE_MARKER: &str = "Available spaces:";
pub const SPOTS_MARKER: &str = "Recommended spots:";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResponse {
    pub available_spaces: u32,
    pub recommended_spots: Vec<String>,
}

/// Parsed answer bound to the frame it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub available_spaces: u32,
    pub recommended_spots: Vec<String>,
    pub frame_index: u64,
    pub fps: u32,
}

impl AnalysisResult {
    pub fn from_parsed(parsed: ParsedResponse, frame_index: u64, fps: u32) -> Self {
        Self {
            available_spaces: parsed.available_spaces,
            recommended_spots: parsed.recommended_spots,
            frame_index,
            fps,
        }
    }
}

pub fn parse_response(text: &str) -> ParsedResponse {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    ParsedResponse {
        available_spaces: available_spaces(&lines),
        recommended_spots: recommended_spots(&lines),
    }
}

fn available_spaces(lines: &[&str]) -> u32 {
    let Some(line) = lines.iter().find(|line| line.contains(AVAILABLE_MARKER)) else {
        return 0;
    };

    // Digits before the marker are list numbering ("1. Available spaces: ...")
    let after = match line.find(AVAILABLE_MARKER) {
        Some(pos) => &line[pos + AVAILABLE_MARKER.len()..],
        None => return 0,
    };

    first_digit_run(after)
        .map(|digits| digits.parse::<u32>().unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn first_digit_run(s: &str) -> Option<&str> {
    let start = s.find(|c: char| c.is_ascii_digit())?;
    let rest = &s[start..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    Some(&rest[..end])
}

fn recommended_spots(lines: &[&str]) -> Vec<String> {
    let Some(marker) = lines.iter().position(|line| line.contains(SPOTS_MARKER)) else {
        return Vec::new();
    };

    lines[marker + 1..]
        .iter()
        .filter_map(|line| line.strip_prefix('-'))
        .map(str::trim)
        .filter(|spot| !spot.is_empty())
        .map(str::to_string)
        .collect()
}
