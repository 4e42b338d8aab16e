// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric naming helpers.

/// True when `name` matches `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Maps every character outside the metric name alphabet to `_`, and prefixes names starting
/// with a digit with `_`. Statsd names such as `page.views` become `page_views`.
///
/// ```
/// use telemetry_pipeline::util::sanitize_metric_name;
///
/// assert_eq!(sanitize_metric_name("page.views"), "page_views");
/// assert_eq!(sanitize_metric_name("5xx-errors"), "_5xx_errors");
/// ```
pub fn sanitize_metric_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len() + 1);
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.push('_');
    }
    sanitized.extend(name.chars().map(|c| {
        if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
            c
        } else {
            '_'
        }
    }));
    sanitized
}

/// Parses and validates a metric namespace.
///
/// A valid namespace starts with an ASCII letter and contains only ASCII alphanumerics or
/// underscores. Whitespace is trimmed. Invalid namespaces are logged and ignored.
///
/// ```
/// use telemetry_pipeline::util::parse_metric_namespace;
///
/// assert_eq!(parse_metric_namespace("myapp"), Some("myapp".to_string()));
/// assert_eq!(parse_metric_namespace("1invalid"), None);
/// assert_eq!(parse_metric_namespace("my-app"), None);
/// ```
pub fn parse_metric_namespace(namespace: &str) -> Option<String> {
    let trimmed = namespace.trim();
    let first_char = trimmed.chars().next()?;

    if !first_char.is_ascii_alphabetic() {
        tracing::error!(
            "PIPELINE_METRIC_NAMESPACE must start with a letter, got: '{}'. Ignoring namespace.",
            trimmed
        );
        return None;
    }

    if let Some(invalid_char) = trimmed
        .chars()
        .find(|&ch| !ch.is_ascii_alphanumeric() && ch != '_')
    {
        tracing::error!(
            "PIPELINE_METRIC_NAMESPACE contains invalid character '{}' in '{}'. Only ASCII alphanumerics and underscores are allowed. Ignoring namespace.",
            invalid_char, trimmed
        );
        return None;
    }

    Some(trimmed.to_string())
}

/// Prefixes `name` with `namespace_` when a namespace is set.
pub fn namespaced(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}_{name}"),
        None => name.to_string(),
    }
}
