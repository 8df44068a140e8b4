use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Context;
use regex::Regex;

use crate::common::{KeyValue, MapReduceApp};

static WORDS: OnceLock<Regex> = OnceLock::new();

pub struct WordCount;

impl MapReduceApp for WordCount {
    fn map(&self, _filename: &str, contents: &str) -> Vec<KeyValue> {
        let words_regex =
            WORDS.get_or_init(|| Regex::new(r"\b[a-zA-Z0-9]+\b").expect("invalid regex"));
        words_regex
            .find_iter(contents)
            .map(|w| KeyValue::new(w.as_str().to_lowercase(), "1"))
            .collect()
    }

    fn reduce(&self, key: &str, values: &[String]) -> String {
        format!("{} {}\n", key, values.len())
    }
}

/// Counts how often each URL (one per line) appears.
pub struct UrlCount;

impl MapReduceApp for UrlCount {
    fn map(&self, _filename: &str, contents: &str) -> Vec<KeyValue> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            *counts.entry(line).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .map(|(url, count)| KeyValue::new(url, count.to_string()))
            .collect()
    }

    fn reduce(&self, key: &str, values: &[String]) -> String {
        // map only ever emits decimal counts; anything else fails the task
        let sum: usize = values
            .iter()
            .map(|v| {
                v.parse::<usize>()
                    .unwrap_or_else(|err| panic!("bad count {:?} for {}: {}", v, key, err))
            })
            .sum();
        format!("{} {}\n", key, sum)
    }
}

/// Parses `"{key} {count}"` lines, as written by the apps above, summing
/// repeated keys.
pub fn parse_counts(text: &str) -> anyhow::Result<HashMap<String, usize>> {
    let mut counts = HashMap::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let (key, count) = line
            .rsplit_once(' ')
            .with_context(|| format!("malformed count line {:?}", line))?;
        let count: usize = count
            .parse()
            .with_context(|| format!("malformed count in {:?}", line))?;
        *counts.entry(key.to_string()).or_insert(0) += count;
    }
    Ok(counts)
}
