//! Text exposition format (version 0.0.4) and gzip encoding of the output.

use std::io::{self, Write};

use flate2::{write::GzEncoder, Compression};

use super::metric::MetricDesc;

/// Content type announced for rendered output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Compression level applied to scrape responses.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 5;

pub(crate) fn write_metric(
    out: &mut Vec<u8>,
    fq_name: &str,
    desc: &MetricDesc,
    series: &[(Vec<String>, f64)],
) {
    let mut text = String::new();
    text.push_str("# HELP ");
    text.push_str(fq_name);
    text.push(' ');
    text.push_str(&escape_help(&desc.help));
    text.push('\n');
    text.push_str("# TYPE ");
    text.push_str(fq_name);
    text.push(' ');
    text.push_str(desc.kind.as_str());
    text.push('\n');

    for (label_values, value) in series {
        text.push_str(fq_name);
        if !desc.label_names.is_empty() {
            text.push('{');
            for (i, (name, value)) in desc.label_names.iter().zip(label_values).enumerate() {
                if i > 0 {
                    text.push(',');
                }
                text.push_str(name);
                text.push_str("=\"");
                text.push_str(&escape_label_value(value));
                text.push('"');
            }
            text.push('}');
        }
        text.push(' ');
        text.push_str(&format_value(*value));
        text.push('\n');
    }

    out.extend_from_slice(text.as_bytes());
}

/// Formats a sample value. Finite values always carry a fractional part.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{:?}", value)
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', r"\\").replace('\n', r"\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}

/// Gzip-compresses `content` as a single member.
///
/// # Errors
///
/// Propagates I/O errors from the encoder (not expected for in-memory buffers).
pub fn gzip(content: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(content.len() / 4 + 64),
        Compression::new(level.min(9)),
    );
    encoder.write_all(content)?;
    encoder.finish()
}
