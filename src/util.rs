//! Small helpers shared across the codebase.

const TRUNCATED_MARKER: &str = "\n...[truncated]";

/// Bound captured process output to `max_bytes`, appending a marker when cut.
///
/// The cut point walks back to the nearest char boundary so the stored
/// string stays valid UTF-8 even when the byte limit lands inside a
/// multi-byte character.
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }

    if max_bytes <= TRUNCATED_MARKER.len() {
        return TRUNCATED_MARKER.to_string();
    }

    let mut cutoff = max_bytes - TRUNCATED_MARKER.len();
    while cutoff > 0 && !output.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = output[..cutoff].to_string();
    truncated.push_str(TRUNCATED_MARKER);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_output_unchanged() {
        assert_eq!(truncate_output("ok", 100), "ok");
        assert_eq!(truncate_output("", 10), "");
    }

    #[test]
    fn truncate_long_output_is_bounded_and_marked() {
        let long = "x".repeat(4096);
        let out = truncate_output(&long, 256);
        assert!(out.len() <= 256);
        assert!(out.ends_with(TRUNCATED_MARKER));
    }

    #[test]
    fn truncate_does_not_split_multibyte_char() {
        let long = "é".repeat(300);
        let out = truncate_output(&long, 128);
        assert!(out.is_char_boundary(out.len()));
        assert!(out.ends_with(TRUNCATED_MARKER));
    }

    #[test]
    fn truncate_handles_mixed_width_text() {
        // 1-, 2-, 3- and 4-byte characters around the cut point.
        let long = "aé你🦀".repeat(100);
        for limit in [20, 21, 22, 23, 24] {
            let out = truncate_output(&long, limit);
            assert!(out.len() <= limit);
            assert!(out.ends_with(TRUNCATED_MARKER));
        }
    }

    #[test]
    fn truncate_with_tiny_limit_is_just_the_marker() {
        let out = truncate_output("something long enough", 4);
        assert_eq!(out, TRUNCATED_MARKER);
    }
}
