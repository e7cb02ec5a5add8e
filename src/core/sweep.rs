//! Expansion of a command file and a hyperparameter table into a batch of jobs.
//!
//! Command lines may contain `<name>` placeholders. The hyperparameter file is
//! a YAML mapping of name to list of values; all lists must have the same
//! length `n`, and the batch gets `n` jobs where job `i` substitutes the
//! `i`-th value of every list.

use crate::core::job::{Job, JobBuilder, JobIdGenerator};
use anyhow::{bail, Context, Result};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub type Hyperparams = BTreeMap<String, Vec<Value>>;

/// Non-empty, trimmed lines of a command file.
pub fn read_commands(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read command file {}", path.display()))?;
    Ok(parse_commands(&text))
}

pub fn parse_commands(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn read_hyperparams(path: &Path) -> Result<Hyperparams> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read hyperparameter file {}", path.display()))?;
    parse_hyperparams(&text)
        .with_context(|| format!("Invalid hyperparameter file {}", path.display()))
}

pub fn parse_hyperparams(text: &str) -> Result<Hyperparams> {
    if text.trim().is_empty() {
        return Ok(Hyperparams::new());
    }
    Ok(serde_yaml::from_str(text)?)
}

fn render_value(value: &Value) -> Result<String> {
    Ok(match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)?.trim().to_string(),
    })
}

/// One command set per sweep point, in order.
///
/// Without hyperparameters the commands form a single set.
pub fn expand(commands: &[String], hyperparams: &Hyperparams) -> Result<Vec<Vec<String>>> {
    let Some(size) = hyperparams.values().map(Vec::len).next() else {
        return Ok(vec![commands.to_vec()]);
    };
    if let Some((name, values)) = hyperparams.iter().find(|(_, v)| v.len() != size) {
        bail!(
            "Hyperparameter '{}' has {} values, expected {}",
            name,
            values.len(),
            size
        );
    }
    if size == 0 {
        bail!("Hyperparameter lists are empty");
    }

    let mut sets = Vec::with_capacity(size);
    for i in 0..size {
        let mut set = commands.to_vec();
        for (name, values) in hyperparams {
            let placeholder = format!("<{name}>");
            let value = render_value(&values[i])?;
            for command in &mut set {
                if command.contains(&placeholder) {
                    *command = command.replace(&placeholder, &value);
                }
            }
        }
        sets.push(set);
    }
    Ok(sets)
}

/// One job per command set, numbered in order, sharing everything else with `template`.
pub fn build_jobs(
    template: &JobBuilder,
    command_sets: Vec<Vec<String>>,
    ids: &mut JobIdGenerator,
) -> Result<Vec<Job>> {
    command_sets
        .into_iter()
        .enumerate()
        .map(|(number, commands)| {
            template
                .clone()
                .commands(commands)
                .number(number as u32)
                .build(ids.next_id())
        })
        .collect()
}
