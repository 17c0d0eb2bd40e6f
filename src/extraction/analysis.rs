//! Buffer pre-analysis - cheap structural probe run before any strategy
//!
//! Looks at a bounded prefix of the upload and answers the questions the
//! extractor needs for candidate selection: which delimiters are plausible,
//! are there quoted fields, does the first row look like a header, is the
//! content numeric-heavy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How much of the buffer the analysis inspects
pub const ANALYSIS_WINDOW_BYTES: usize = 64 * 1024;

/// How many sample lines participate in shape statistics
pub const SAMPLE_LINE_LIMIT: usize = 20;

/// Delimiters the analysis counts, in preference order
pub const CANDIDATE_DELIMITERS: [char; 5] = [',', ';', '\t', '|', ':'];

/// Share of numeric cells above which content counts as numeric-heavy
pub const NUMERIC_HEAVY_THRESHOLD: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineEnding {
    Lf,
    CrLf,
    Cr,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
            LineEnding::Cr => "\r",
        }
    }
}

/// Structural snapshot of a buffer prefix
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferAnalysis {
    /// Total occurrences of each candidate delimiter in the window
    pub delimiter_counts: HashMap<char, usize>,

    /// Delimiters that appear on every sampled line at a stable count
    pub plausible_delimiters: Vec<char>,

    /// The single most frequent candidate delimiter
    pub dominant_delimiter: char,

    pub has_quotes: bool,
    pub has_escapes: bool,
    pub line_ending: LineEnding,

    /// Modal field count per line under the dominant delimiter
    pub estimated_columns: usize,

    pub sampled_lines: usize,

    /// True when most sampled cells parse as numbers
    pub numeric_heavy: bool,

    /// True when every cell of the first line is non-numeric text
    pub first_row_textual: bool,

    /// Best-effort header call: textual first row followed by a row of mixed
    /// or numeric cells. Known to misfire on single-column numeric files with
    /// a text label in row one; treated as a hint, never as ground truth.
    pub header_likely: bool,
}

/// Analyze a bounded prefix of the buffer.
pub fn analyze(buffer: &[u8]) -> BufferAnalysis {
    let window = &buffer[..buffer.len().min(ANALYSIS_WINDOW_BYTES)];
    let text = String::from_utf8_lossy(window);

    let line_ending = detect_line_ending(&text);
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(SAMPLE_LINE_LIMIT)
        .collect();

    let mut delimiter_counts: HashMap<char, usize> = HashMap::new();
    for delim in CANDIDATE_DELIMITERS {
        let count = lines.iter().map(|l| l.matches(delim).count()).sum();
        delimiter_counts.insert(delim, count);
    }

    // A delimiter is plausible when it shows up on every sampled line and
    // the per-line counts agree on a modal value.
    let mut plausible_delimiters = Vec::new();
    for delim in CANDIDATE_DELIMITERS {
        if lines.is_empty() {
            continue;
        }
        let per_line: Vec<usize> = lines.iter().map(|l| l.matches(delim).count()).collect();
        if per_line.iter().all(|&c| c > 0) {
            let modal = modal_count(&per_line);
            let agreeing = per_line.iter().filter(|&&c| c == modal).count();
            if agreeing * 2 >= per_line.len() {
                plausible_delimiters.push(delim);
            }
        }
    }

    let dominant_delimiter = CANDIDATE_DELIMITERS
        .iter()
        .copied()
        .max_by_key(|d| delimiter_counts.get(d).copied().unwrap_or(0))
        .unwrap_or(',');

    let per_line_fields: Vec<usize> = lines
        .iter()
        .map(|l| l.matches(dominant_delimiter).count() + 1)
        .collect();
    let estimated_columns = if per_line_fields.is_empty() {
        1
    } else {
        modal_count(&per_line_fields)
    };

    let has_quotes = window.contains(&b'"');
    let has_escapes = window.contains(&b'\\');

    let (numeric_heavy, first_row_textual, header_likely) =
        classify_content(&lines, dominant_delimiter);

    BufferAnalysis {
        delimiter_counts,
        plausible_delimiters,
        dominant_delimiter,
        has_quotes,
        has_escapes,
        line_ending,
        estimated_columns,
        sampled_lines: lines.len(),
        numeric_heavy,
        first_row_textual,
        header_likely,
    }
}

fn detect_line_ending(text: &str) -> LineEnding {
    if text.contains("\r\n") {
        LineEnding::CrLf
    } else if text.contains('\r') && !text.contains('\n') {
        LineEnding::Cr
    } else {
        LineEnding::Lf
    }
}

fn modal_count(values: &[usize]) -> usize {
    let mut freq: HashMap<usize, usize> = HashMap::new();
    for &v in values {
        *freq.entry(v).or_insert(0) += 1;
    }
    freq.into_iter()
        .max_by_key(|&(value, count)| (count, value))
        .map(|(value, _)| value)
        .unwrap_or(1)
}

fn looks_numeric(cell: &str) -> bool {
    let trimmed = cell.trim().trim_matches('"');
    if trimmed.is_empty() {
        return false;
    }
    trimmed
        .trim_start_matches(['$', '€', '£', '-', '+'])
        .trim_end_matches('%')
        .replace(',', "")
        .parse::<f64>()
        .is_ok()
}

fn classify_content(lines: &[&str], delimiter: char) -> (bool, bool, bool) {
    if lines.is_empty() {
        return (false, false, false);
    }

    let split = |line: &str| -> Vec<String> {
        line.split(delimiter).map(|c| c.trim().to_string()).collect()
    };

    let first_cells = split(lines[0]);
    let first_row_textual = !first_cells.is_empty()
        && first_cells
            .iter()
            .all(|c| !c.is_empty() && !looks_numeric(c));

    let mut numeric_cells = 0usize;
    let mut total_cells = 0usize;
    for line in lines.iter().skip(1) {
        for cell in split(line) {
            if cell.is_empty() {
                continue;
            }
            total_cells += 1;
            if looks_numeric(&cell) {
                numeric_cells += 1;
            }
        }
    }
    let numeric_heavy = total_cells > 0
        && numeric_cells as f64 / total_cells as f64 >= NUMERIC_HEAVY_THRESHOLD;

    // Header call: first row all text, second row containing at least one
    // non-textual cell.
    let header_likely = if lines.len() > 1 && first_row_textual {
        let second_cells = split(lines[1]);
        second_cells.iter().any(|c| looks_numeric(c) || c.is_empty())
    } else {
        first_row_textual && lines.len() == 1
    };

    (numeric_heavy, first_row_textual, header_likely)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_comma_as_dominant() {
        let analysis = analyze(b"name,price\nWidget,9.99\nBolt,1.25\n");
        assert_eq!(analysis.dominant_delimiter, ',');
        assert_eq!(analysis.estimated_columns, 2);
        assert!(analysis.plausible_delimiters.contains(&','));
    }

    #[test]
    fn test_detects_semicolon_delimiter() {
        let analysis = analyze(b"name;price\nWidget;9.99\nBolt;1.25\n");
        assert_eq!(analysis.dominant_delimiter, ';');
        assert!(analysis.plausible_delimiters.contains(&';'));
    }

    #[test]
    fn test_header_likely_for_text_then_numbers() {
        let analysis = analyze(b"name,price\nWidget,9.99\n");
        assert!(analysis.first_row_textual);
        assert!(analysis.header_likely);
    }

    #[test]
    fn test_headerless_numeric_file() {
        let analysis = analyze(b"1,2,3\n4,5,6\n7,8,9\n");
        assert!(!analysis.first_row_textual);
        assert!(!analysis.header_likely);
        assert!(analysis.numeric_heavy);
    }

    #[test]
    fn test_quote_detection() {
        let analysis = analyze(b"name,note\n\"Widget, large\",ok\n");
        assert!(analysis.has_quotes);
    }

    #[test]
    fn test_crlf_line_ending() {
        let analysis = analyze(b"a,b\r\n1,2\r\n");
        assert_eq!(analysis.line_ending, LineEnding::CrLf);
    }
}
