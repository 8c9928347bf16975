//! Prometheus text exposition format.
//!
//! Renders metric families into the text format (version 0.0.4) for
//! scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

/// Content type of a rendered exposition body.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Value of the `# TYPE` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Gauge,
    Counter,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
            MetricKind::Summary => "summary",
        }
    }
}

/// One exposition line: labels and a value.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Appended to the family name (`_sum`, `_count` for summaries).
    pub suffix: &'static str,
    /// Label pairs, rendered in the given order.
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl Sample {
    pub fn new(labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            suffix: "",
            labels,
            value,
        }
    }

    pub fn with_suffix(mut self, suffix: &'static str) -> Self {
        self.suffix = suffix;
        self
    }
}

/// A named group of samples sharing help text and type.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, help: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            kind,
            samples: Vec::new(),
        }
    }
}

/// Render families in the given order. An empty slice renders an empty body.
pub fn render_families(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(&family.help));
        let _ = writeln!(out, "# TYPE {} {}", family.name, family.kind.as_str());
        for sample in &family.samples {
            out.push_str(&family.name);
            out.push_str(sample.suffix);
            if !sample.labels.is_empty() {
                out.push('{');
                for (i, (key, value)) in sample.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{key}=\"{}\"", escape_label_value(value));
                }
                out.push('}');
            }
            out.push(' ');
            out.push_str(&format_value(sample.value));
            out.push('\n');
        }
    }
    out
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_empty() {
        assert_eq!(render_families(&[]), "");
    }

    #[test]
    fn render_family_with_labels() {
        let mut family = MetricFamily::new("azurerm_resource_metric", "Azure metric", MetricKind::Gauge);
        family.samples.push(Sample::new(labels(&[("resourceID", "/a"), ("metric", "cpu")]), 12.5));
        family.samples.push(Sample::new(labels(&[]), 3.0));

        let output = render_families(&[family]);
        assert_eq!(
            output,
            "# HELP azurerm_resource_metric Azure metric\n\
             # TYPE azurerm_resource_metric gauge\n\
             azurerm_resource_metric{resourceID=\"/a\",metric=\"cpu\"} 12.5\n\
             azurerm_resource_metric 3\n"
        );
    }

    #[test]
    fn render_escapes_label_values_and_help() {
        let mut family = MetricFamily::new("m", "line1\nline2 \\", MetricKind::Gauge);
        family
            .samples
            .push(Sample::new(labels(&[("l", "a\"b\\c\nd")]), 1.0));
        let output = render_families(&[family]);
        assert!(output.contains("# HELP m line1\\nline2 \\\\\n"));
        assert!(output.contains("m{l=\"a\\\"b\\\\c\\nd\"} 1\n"));
    }

    #[test]
    fn render_special_values() {
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NEG_INFINITY), "-Inf");
        assert_eq!(format_value(0.25), "0.25");
    }

    #[test]
    fn render_summary_suffixes() {
        let mut family = MetricFamily::new("t", "latency", MetricKind::Summary);
        family.samples.push(Sample::new(labels(&[]), 2.0).with_suffix("_sum"));
        family.samples.push(Sample::new(labels(&[]), 4.0).with_suffix("_count"));
        let output = render_families(&[family]);
        assert!(output.contains("# TYPE t summary\n"));
        assert!(output.contains("t_sum 2\n"));
        assert!(output.contains("t_count 4\n"));
    }
}
