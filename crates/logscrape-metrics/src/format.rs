//! Support for various metrics exposition text formats.

use std::{fmt, mem};

/// Metrics export format, selected by the exporter based on the `Accept` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Format {
    /// [OpenMetrics text format][om], the format natively produced by `prometheus-client`.
    ///
    /// [om]: https://github.com/OpenObservability/OpenMetrics/blob/main/specification/OpenMetrics.md
    OpenMetrics,
    /// [Prometheus text format][prom]. Obtained by a streaming transform of OpenMetrics-encoded
    /// text that removes `_total` suffixes from counter names and drops the `# EOF` terminator.
    ///
    /// [prom]: https://prometheus.io/docs/instrumenting/exposition_formats/
    Prometheus,
    /// OpenMetrics text format as understood by Prometheus: Prometheus mostly understands
    /// OpenMetrics, except that it doesn't expect the mandatory `_total` suffix on counters.
    OpenMetricsForPrometheus,
}

impl Format {
    /// Content type reported for [`Self::OpenMetrics`] and [`Self::OpenMetricsForPrometheus`].
    pub const OPEN_METRICS_CONTENT_TYPE: &'static str =
        "application/openmetrics-text; version=1.0.0; charset=utf-8";
    /// Content type reported for [`Self::Prometheus`].
    pub const PROMETHEUS_CONTENT_TYPE: &'static str = "text/plain; version=0.0.4; charset=utf-8";

    /// Picks a format from the value of an incoming `Accept` header. Defaults to
    /// [`Self::OpenMetricsForPrometheus`], the format closest to what Prometheus expects when
    /// the header is absent or unrecognized.
    pub fn from_accept_header(accept: Option<&str>) -> Self {
        match accept {
            Some(header) if header.contains("application/openmetrics-text") => Self::OpenMetrics,
            Some(header) if header.contains("text/plain") => Self::Prometheus,
            _ => Self::OpenMetricsForPrometheus,
        }
    }
}

#[derive(Debug)]
struct MetricTypeDefinition {
    name: String,
    is_counter: bool,
}

impl MetricTypeDefinition {
    fn parse(line: &str) -> Result<Self, fmt::Error> {
        let (name, ty) = line
            .trim()
            .split_once(|ch: char| ch.is_ascii_whitespace())
            .ok_or(fmt::Error)?;
        Ok(Self {
            name: name.to_owned(),
            is_counter: ty == "counter",
        })
    }
}

#[must_use = "Must be `flush()`ed to not lose the last line"]
#[derive(Debug)]
pub(crate) struct PrometheusWrapper<'a, W> {
    writer: &'a mut W,
    remove_eof_terminator: bool,
    last_metric_definition: Option<MetricTypeDefinition>,
    last_line: String,
}

impl<'a, W: fmt::Write> PrometheusWrapper<'a, W> {
    pub(crate) fn new(writer: &'a mut W, remove_eof_terminator: bool) -> Self {
        Self {
            writer,
            remove_eof_terminator,
            last_metric_definition: None,
            last_line: String::new(),
        }
    }

    fn handle_line(&mut self) -> fmt::Result {
        let line = mem::take(&mut self.last_line);
        if line == "# EOF" && self.remove_eof_terminator {
            // Prometheus format doesn't specify the termination sequence, so we skip it.
            return Ok(());
        }
        let mut transformed_line = None;

        if let Some(type_def) = line.strip_prefix("# TYPE ") {
            self.last_metric_definition = Some(MetricTypeDefinition::parse(type_def)?);
        } else if !line.starts_with('#') {
            // `line` reports a metric value
            let name_end_pos = line
                .find(|ch: char| ch == '{' || ch.is_ascii_whitespace())
                .ok_or(fmt::Error)?;
            let (name, rest) = line.split_at(name_end_pos);

            if let Some(metric_type) = &self.last_metric_definition {
                let truncated_name = name.strip_suffix("_total");

                if truncated_name == Some(&metric_type.name) && metric_type.is_counter {
                    // OpenMetrics mandates a `_total` suffix for counters that the Prometheus
                    // text format doesn't carry.
                    transformed_line = Some(format!("{}{rest}", metric_type.name));
                }
            }
        }

        let transformed_line = transformed_line.unwrap_or(line);
        writeln!(self.writer, "{transformed_line}")
    }

    pub(crate) fn flush(mut self) -> fmt::Result {
        if self.last_line.is_empty() {
            Ok(())
        } else {
            self.handle_line()
        }
    }
}

impl<W: fmt::Write> fmt::Write for PrometheusWrapper<'_, W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let lines: Vec<_> = s.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            self.last_line.push_str(line);
            if i + 1 < lines.len() || s.ends_with('\n') {
                self.handle_line()?;
            }
        }
        Ok(())
    }
}

/// Rewrites concatenated OpenMetrics fragments (one per sub-registry) into a single valid
/// document: interior `# EOF` terminators are dropped and a single one is appended at the end.
pub(crate) fn merge_eof_terminators(fragments: &[String]) -> String {
    let mut buffer = String::new();
    for fragment in fragments {
        for line in fragment.lines() {
            if line == "# EOF" {
                continue;
            }
            buffer.push_str(line);
            buffer.push('\n');
        }
    }
    buffer.push_str("# EOF\n");
    buffer
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;

    use super::*;

    #[test]
    fn translating_open_metrics_format() {
        let mut buffer = String::new();
        let mut wrapper = PrometheusWrapper::new(&mut buffer, true);

        // Emulating breaking line into multiple write instructions
        write!(wrapper, "# HELP ").unwrap();
        write!(wrapper, "http_requests").unwrap();
        write!(wrapper, " ").unwrap();
        writeln!(wrapper, "Number of HTTP requests.").unwrap();

        write!(wrapper, "# TYPE ").unwrap();
        write!(wrapper, "http_requests").unwrap();
        write!(wrapper, " ").unwrap();
        writeln!(wrapper, "counter").unwrap();

        write!(wrapper, "http_requests").unwrap();
        write!(wrapper, "_total").unwrap();
        write!(wrapper, "{{").unwrap();
        write!(wrapper, "method=\"").unwrap();
        write!(wrapper, "call").unwrap();
        write!(wrapper, "\"}} ").unwrap();
        writeln!(wrapper, "42").unwrap();

        writeln!(wrapper, "# EOF").unwrap();

        wrapper.flush().unwrap();
        let lines: Vec<_> = buffer.lines().collect();
        assert_eq!(
            lines,
            [
                "# HELP http_requests Number of HTTP requests.",
                "# TYPE http_requests counter",
                "http_requests{method=\"call\"} 42",
            ]
        );
    }

    #[test]
    fn translating_sample() {
        let input = "\
            # TYPE modern_counter counter\n\
            modern_counter_total 1\n\
            # TYPE modern_gauge gauge\n\
            modern_gauge{label=\"value\"} 23\n\
            # TYPE modern_counter_with_labels counter\n\
            modern_counter_with_labels_total{label=\"value\"} 3\n\
            modern_counter_with_labels_total{label=\"other\"} 5";
        let expected = "\
            # TYPE modern_counter counter\n\
            modern_counter 1\n\
            # TYPE modern_gauge gauge\n\
            modern_gauge{label=\"value\"} 23\n\
            # TYPE modern_counter_with_labels counter\n\
            modern_counter_with_labels{label=\"value\"} 3\n\
            modern_counter_with_labels{label=\"other\"} 5\n";

        let mut buffer = String::new();
        let mut wrapper = PrometheusWrapper::new(&mut buffer, true);
        wrapper.write_str(input).unwrap();
        wrapper.flush().unwrap();

        assert_eq!(buffer, expected);
    }

    #[test]
    fn merging_fragments_keeps_single_eof() {
        let fragments = vec![
            "# TYPE a counter\na_total 1\n# EOF\n".to_owned(),
            "# TYPE b gauge\nb 2\n# EOF\n".to_owned(),
        ];
        let merged = merge_eof_terminators(&fragments);
        assert_eq!(merged.matches("# EOF").count(), 1);
        assert!(merged.trim_end().ends_with("# EOF"));
        assert!(merged.contains("a_total 1"));
        assert!(merged.contains("b 2"));
    }

    #[test]
    fn accept_header_selection() {
        assert_eq!(
            Format::from_accept_header(Some("application/openmetrics-text; version=1.0.0")),
            Format::OpenMetrics
        );
        assert_eq!(
            Format::from_accept_header(Some("text/plain")),
            Format::Prometheus
        );
        assert_eq!(
            Format::from_accept_header(None),
            Format::OpenMetricsForPrometheus
        );
    }
}
