use crate::core::inventory::GpuCounts;
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use std::io::Write;

pub mod parsers;

pub use parsers::{parse_partitions, parse_selection};

/// Render per-type counts as `a100:2,v100:1`, or `-` when empty.
///
/// # Examples
///
/// ```
/// use gslurm::core::inventory::GpuCounts;
/// use gslurm::utils::format_counts;
///
/// let counts = GpuCounts::from([("v100".to_string(), 1), ("a100".to_string(), 2)]);
/// assert_eq!(format_counts(&counts), "a100:2,v100:1");
/// assert_eq!(format_counts(&GpuCounts::new()), "-");
/// ```
pub fn format_counts(counts: &GpuCounts) -> String {
    if counts.is_empty() {
        return "-".to_string();
    }
    counts
        .iter()
        .map(|(gpu_type, n)| format!("{gpu_type}:{n}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Shorten `text` to at most `max` characters, marking the cut with `…`.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{kept}…")
}

/// Write a completion script for `bin_name` to stdout. A closed pipe is not an error.
pub fn generate_completions(
    shell: clap_complete::Shell,
    cmd: &mut clap::Command,
    bin_name: &str,
) -> anyhow::Result<()> {
    let mut buf = Vec::<u8>::new();
    clap_complete::generate(shell, cmd, bin_name, &mut buf);

    match std::io::stdout().write_all(&buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("python train.py", 40), "python train.py");
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("abc", 0), "…");
    }
}
