//! Tokenizes a log line and applies a fixed, schema-derived chain of column readers.

use std::collections::HashMap;

use thiserror::Error;

/// One parsed log line: labels pre-seeded with the worker's `environment`, plus the numeric
/// fields extracted by `number`/`clf_number` readers.
#[derive(Debug, Clone, Default)]
pub struct Metric {
    pub labels: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
}

impl Metric {
    fn seeded(base_labels: &HashMap<String, String>) -> Self {
        Self {
            labels: base_labels.clone(),
            metrics: HashMap::new(),
        }
    }
}

/// A line could not be parsed against the configured schema; callers translate this into the
/// sentinel ("parser error") outcome rather than propagating it.
#[derive(Debug, Error)]
#[error("line does not match the configured column schema")]
pub struct ParseError;

/// One column's reader, built once from the configured schema and shared read-only across every
/// tailing worker.
#[derive(Debug, Clone)]
pub enum Reader {
    /// Assigns the token verbatim to a label.
    Label(String),
    /// Parses the token as an integer, falling back to a float; stores it as a numeric field.
    Number(String),
    /// Like `Number`, but a bare `-` (Common Log Format's "no value") maps to zero.
    ClfNumber(String),
    /// Splits the token on spaces into exactly three sub-tokens: `request_method`,
    /// `request_uri`, `request_http_version`.
    RequestHeader,
}

impl Reader {
    fn apply(&self, metric: &mut Metric, token: &str) -> Result<(), ParseError> {
        match self {
            Self::Label(name) => {
                metric.labels.insert(name.clone(), token.to_owned());
            }
            Self::Number(name) => {
                metric.metrics.insert(name.clone(), parse_number(token)?);
            }
            Self::ClfNumber(name) => {
                let value = if token == "-" { 0.0 } else { parse_number(token)? };
                metric.metrics.insert(name.clone(), value);
            }
            Self::RequestHeader => {
                let parts: Vec<&str> = token.split_whitespace().collect();
                let [method, uri, version] = parts.as_slice() else {
                    return Err(ParseError);
                };
                metric
                    .labels
                    .insert("request_method".to_owned(), (*method).to_owned());
                metric
                    .labels
                    .insert("request_uri".to_owned(), (*uri).to_owned());
                metric
                    .labels
                    .insert("request_http_version".to_owned(), (*version).to_owned());
            }
        }
        Ok(())
    }
}

fn parse_number(token: &str) -> Result<f64, ParseError> {
    if let Ok(value) = token.parse::<i64>() {
        return Ok(value as f64);
    }
    token.parse::<f64>().map_err(|_| ParseError)
}

/// Splits a line into space-delimited tokens, with double-quote grouping: a `"` starts a quoted
/// field that runs until the next `"` (no doubled-quote escaping, no backslash escapes); an
/// unterminated quote is a parse error for that line. An empty or all-whitespace line tokenizes
/// to zero fields.
fn tokenize(line: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        if ch == ' ' {
            if in_token {
                tokens.push(std::mem::take(&mut current));
                in_token = false;
            }
            continue;
        }
        in_token = true;
        if ch == '"' {
            let mut closed = false;
            for next_ch in chars.by_ref() {
                if next_ch == '"' {
                    closed = true;
                    break;
                }
                current.push(next_ch);
            }
            if !closed {
                return Err(ParseError);
            }
        } else {
            current.push(ch);
        }
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Parses log lines against a fixed schema shared by every tailing worker.
#[derive(Debug, Clone)]
pub struct LogParser {
    readers: std::sync::Arc<Vec<Option<Reader>>>,
}

impl LogParser {
    /// Creates a parser from a pre-built, ordered reader chain (one entry per schema column,
    /// `None` for a skipped column).
    pub fn new(readers: std::sync::Arc<Vec<Option<Reader>>>) -> Self {
        Self { readers }
    }

    /// Parses one line, returning `None` (the "sentinel") if tokenization fails, the token count
    /// does not match the schema, or any reader rejects its token.
    pub fn parse_line(&self, line: &str, base_labels: &HashMap<String, String>) -> Option<Metric> {
        let tokens = tokenize(line).ok()?;
        if tokens.len() != self.readers.len() {
            return None;
        }

        let mut metric = Metric::seeded(base_labels);
        for (reader, token) in self.readers.iter().zip(tokens.iter()) {
            if let Some(reader) = reader {
                reader.apply(&mut metric, token).ok()?;
            }
        }
        Some(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_labels(environment: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert("environment".to_owned(), environment.to_owned());
        labels
    }

    fn schema() -> Vec<Option<Reader>> {
        vec![
            Some(Reader::Label("remote_addr".to_owned())),
            Some(Reader::Label("status".to_owned())),
            Some(Reader::ClfNumber("bytes".to_owned())),
            Some(Reader::RequestHeader),
        ]
    }

    #[test]
    fn parsing_a_well_formed_line() {
        let parser = LogParser::new(std::sync::Arc::new(schema()));
        let metric = parser
            .parse_line(
                r#"1.2.3.4 200 - "GET /x HTTP/1.1""#,
                &base_labels("p"),
            )
            .unwrap();

        assert_eq!(metric.labels["environment"], "p");
        assert_eq!(metric.labels["remote_addr"], "1.2.3.4");
        assert_eq!(metric.labels["status"], "200");
        assert_eq!(metric.labels["request_method"], "GET");
        assert_eq!(metric.labels["request_uri"], "/x");
        assert_eq!(metric.labels["request_http_version"], "HTTP/1.1");
        assert_eq!(metric.metrics["bytes"], 0.0);
    }

    #[test]
    fn malformed_request_header_is_a_sentinel() {
        let parser = LogParser::new(std::sync::Arc::new(schema()));
        assert!(parser
            .parse_line(r#"1.2.3.4 200 - -"#, &base_labels("p"))
            .is_none());
    }

    #[test]
    fn unterminated_quote_is_a_sentinel() {
        let parser = LogParser::new(std::sync::Arc::new(schema()));
        assert!(parser
            .parse_line(r#"1.2.3.4 200 - "GET /x"#, &base_labels("p"))
            .is_none());
    }

    #[test]
    fn wrong_token_count_is_a_sentinel() {
        let parser = LogParser::new(std::sync::Arc::new(schema()));
        assert!(parser.parse_line("1.2.3.4 200", &base_labels("p")).is_none());
    }

    #[test]
    fn empty_line_has_zero_tokens() {
        let parser = LogParser::new(std::sync::Arc::new(Vec::new()));
        let metric = parser.parse_line("", &base_labels("p")).unwrap();
        assert!(metric.metrics.is_empty());
    }

    #[test]
    fn whitespace_only_line_has_zero_tokens() {
        let parser = LogParser::new(std::sync::Arc::new(Vec::new()));
        assert!(parser.parse_line("   ", &base_labels("p")).is_some());
    }

    #[test]
    fn numbers_fall_back_to_float() {
        let parser = LogParser::new(std::sync::Arc::new(vec![Some(Reader::Number(
            "duration".to_owned(),
        ))]));
        let metric = parser.parse_line("0.125", &base_labels("p")).unwrap();
        assert_eq!(metric.metrics["duration"], 0.125);
    }
}
