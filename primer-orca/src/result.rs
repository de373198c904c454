//! Terminal artifact of a completed job.
//!
//! The optimizer writes, for both the initial and the optimized primer sets,
//! a `.primers` file (one forward/reverse pair of sets per line) and a
//! `.scores` file (a header line, then one tab-separated score row per
//! primer line). [`JobResult::from_outputs`] keeps the raw text and derives
//! the structured matrix once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobId;

/// Column headers of a [`ResultMatrix`] row.
pub const RESULT_COLUMNS: [&str; 5] = [
    "Forward primers",
    "Reverse primers",
    "Efficiency",
    "Coverage",
    "Matching-bias",
];

/// Separator between the forward and the reverse set on a primer line.
const PAIR_SEPARATOR: &str = "\tx\t";

#[derive(Debug, Error, PartialEq)]
pub enum ResultError {
    #[error("{prefix} scores are empty, expected a header line")]
    MissingHeader { prefix: &'static str },
    #[error("{prefix} primers line {line}: expected forward and reverse sets separated by a tab-x-tab")]
    MalformedPair { prefix: &'static str, line: usize },
    #[error("{prefix} scores line {line}: {value:?} is not a number")]
    InvalidScore {
        prefix: &'static str,
        line: usize,
        value: String,
    },
}

/// One primer set pair with its scores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatrixRow {
    /// Degenerate consensus per length cluster of the forward set.
    pub forward: Vec<String>,
    /// Degenerate consensus per length cluster of the reverse set.
    pub reverse: Vec<String>,
    pub scores: Vec<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMatrix {
    pub init: Vec<MatrixRow>,
    pub out: Vec<MatrixRow>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub init_primers: String,
    pub init_scores: String,
    pub out_primers: String,
    pub out_scores: String,
    pub data: ResultMatrix,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    /// Build a result from the four optimizer outputs.
    pub fn from_outputs(
        job_id: JobId,
        init_primers: String,
        init_scores: String,
        out_primers: String,
        out_scores: String,
    ) -> Result<Self, ResultError> {
        let data = ResultMatrix {
            init: structure("init", &init_primers, &init_scores)?,
            out: structure("out", &out_primers, &out_scores)?,
        };
        Ok(Self {
            job_id,
            init_primers,
            init_scores,
            out_primers,
            out_scores,
            data,
            completed_at: Utc::now(),
        })
    }
}

fn structure(
    prefix: &'static str,
    primers: &str,
    scores: &str,
) -> Result<Vec<MatrixRow>, ResultError> {
    let mut score_lines = scores.lines();
    score_lines
        .next()
        .ok_or(ResultError::MissingHeader { prefix })?;

    primers
        .lines()
        .zip(score_lines)
        .enumerate()
        .map(|(index, (pair, score_line))| {
            let line = index + 1;
            let (forward, reverse) = pair
                .split_once(PAIR_SEPARATOR)
                .ok_or(ResultError::MalformedPair { prefix, line })?;
            let scores = score_line
                .split('\t')
                .map(|value| {
                    value
                        .trim()
                        .parse::<f64>()
                        .map_err(|_| ResultError::InvalidScore {
                            prefix,
                            line,
                            value: value.to_string(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(MatrixRow {
                forward: consensus_by_length(forward),
                reverse: consensus_by_length(reverse),
                scores,
            })
        })
        .collect()
}

fn consensus_by_length(primer_set: &str) -> Vec<String> {
    cluster_by_length(primer_set.split('\t'))
        .iter()
        .map(|cluster| degenerate_consensus(cluster))
        .collect()
}

/// Group sequences by length, keeping clusters in first-seen order.
pub fn cluster_by_length<'a>(sequences: impl IntoIterator<Item = &'a str>) -> Vec<Vec<&'a str>> {
    let mut clusters: Vec<Vec<&'a str>> = Vec::new();
    for sequence in sequences {
        match clusters
            .iter_mut()
            .find(|cluster| cluster[0].len() == sequence.len())
        {
            Some(cluster) => cluster.push(sequence),
            None => clusters.push(vec![sequence]),
        }
    }
    clusters
}

const NUCLEOTIDES: [char; 4] = ['A', 'C', 'G', 'T'];

/// IUPAC consensus of equal-length sequences, column by column, following
/// Cavener's rules.
///
/// Only `A`, `C`, `G` and `T` are counted. Ties keep alphabetical order.
pub fn degenerate_consensus(sequences: &[&str]) -> String {
    let length = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    let columns: Vec<Vec<char>> = sequences
        .iter()
        .map(|s| s.chars().map(|c| c.to_ascii_uppercase()).collect())
        .collect();

    (0..length)
        .map(|i| {
            let mut counts = [0usize; 4];
            for base in columns.iter().filter_map(|column| column.get(i)) {
                if let Some(slot) = NUCLEOTIDES.iter().position(|n| n == base) {
                    counts[slot] += 1;
                }
            }
            column_symbol(counts)
        })
        .collect()
}

fn column_symbol(counts: [usize; 4]) -> char {
    // Stable sort keeps alphabetical order among equal counts.
    let mut ranked: Vec<(char, usize)> = NUCLEOTIDES.iter().copied().zip(counts).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let total: usize = counts.iter().sum();
    let c: Vec<usize> = ranked.iter().map(|(_, n)| *n).collect();

    let mut key: Vec<char> = if c[0] > c[1] + c[2] + c[3] && c[0] > 2 * c[1] {
        vec![ranked[0].0]
    } else if 4 * (c[0] + c[1]) > 3 * total {
        ranked[..2].iter().map(|(base, _)| *base).collect()
    } else if c[3] == 0 {
        ranked[..3].iter().map(|(base, _)| *base).collect()
    } else {
        NUCLEOTIDES.to_vec()
    };
    key.sort_unstable();

    match key.as_slice() {
        [base] => *base,
        ['A', 'C'] => 'M',
        ['A', 'G'] => 'R',
        ['A', 'T'] => 'W',
        ['C', 'G'] => 'S',
        ['C', 'T'] => 'Y',
        ['G', 'T'] => 'K',
        ['A', 'C', 'G'] => 'V',
        ['A', 'C', 'T'] => 'H',
        ['A', 'G', 'T'] => 'D',
        ['C', 'G', 'T'] => 'B',
        _ => 'N',
    }
}
