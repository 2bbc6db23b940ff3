//! Progress UI (byte bar) for transfers.

use indicatif::{ProgressBar, ProgressStyle};

/// Returns a byte progress bar, or a hidden one when `enabled` is false.
pub(crate) fn transfer_bar(enabled: bool, total: u64, message: &str) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    bar.set_message(message.to_string());
    bar
}

#[cfg(test)]
mod tests {
    use super::transfer_bar;

    #[test]
    fn test_disabled_bar_is_hidden() {
        let bar = transfer_bar(false, 10, "k");
        assert!(bar.is_hidden());
        bar.inc(5);
        assert_eq!(bar.position(), 5);
    }

    #[test]
    fn test_enabled_bar_tracks_length() {
        let bar = transfer_bar(true, 10, "k");
        assert_eq!(bar.length(), Some(10));
        bar.finish_and_clear();
    }
}
