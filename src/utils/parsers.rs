use anyhow::{bail, Context, Result};
use range_parser::parse;

/// Parse a comma separated partition list. Names are trimmed and lowercased;
/// duplicates are dropped, keeping the first occurrence.
///
/// # Examples
///
/// ```
/// use gslurm::utils::parsers::parse_partitions;
///
/// assert_eq!(
///     parse_partitions("notchpeak-gpu, Kingspeak-GPU").unwrap(),
///     vec!["notchpeak-gpu", "kingspeak-gpu"]
/// );
/// assert!(parse_partitions(" , ").is_err());
/// ```
pub fn parse_partitions(input: &str) -> Result<Vec<String>> {
    let mut partitions: Vec<String> = Vec::new();
    for name in input.split(',').map(|p| p.trim().to_lowercase()) {
        if !name.is_empty() && !partitions.contains(&name) {
            partitions.push(name);
        }
    }
    if partitions.is_empty() {
        bail!("No partition given in '{}'", input);
    }
    Ok(partitions)
}

/// Parse a selection of ordinals such as `0-3,7`, sorted and deduplicated.
///
/// # Examples
///
/// ```
/// use gslurm::utils::parsers::parse_selection;
///
/// assert_eq!(parse_selection("2").unwrap(), vec![2]);
/// assert_eq!(parse_selection("0-2,5,1").unwrap(), vec![0, 1, 2, 5]);
/// ```
pub fn parse_selection(input: &str) -> Result<Vec<u32>> {
    let mut parsed: Vec<u32> =
        parse::<u32>(input.trim()).context(format!("Invalid selection or range: {}", input))?;

    parsed.sort_unstable();
    parsed.dedup();

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partitions_dedup() {
        assert_eq!(parse_partitions("p1,P1 ,p2").unwrap(), vec!["p1", "p2"]);
        assert_eq!(parse_partitions("single").unwrap(), vec!["single"]);
    }

    #[test]
    fn test_parse_selection_invalid() {
        assert!(parse_selection("a-b").is_err());
        assert!(parse_selection("").is_err());
    }
}
