//! Small helpers shared by the scheduler, platform clients and CLI

pub mod error;
pub mod retry;

/// Shorten a log or table field to at most `max_len` bytes, marking the cut
///
/// Used for response bodies and locators, which can be arbitrarily long.
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_owned();
    }

    // Back off to a char boundary so multi-byte text never splits
    let cut = (0..=max_len.saturating_sub(3))
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    format!("{}...", &text[..cut])
}

/// Payload size for log fields, in binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
