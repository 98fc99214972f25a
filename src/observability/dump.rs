//! Diagnostic Dump
//!
//! Nested tag/value tree written by the daemons for operational tooling.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::{self, Write as _};

/// One node of a diagnostic dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpNode {
    tag: String,
    value: Option<String>,
    children: Vec<DumpNode>,
}

impl DumpNode {
    /// Node that only holds children
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            value: None,
            children: Vec::new(),
        }
    }

    /// Node holding a single value
    pub fn leaf(tag: impl Into<String>, value: impl fmt::Display) -> Self {
        Self {
            tag: tag.into(),
            value: Some(value.to_string()),
            children: Vec::new(),
        }
    }

    /// Leaf for a timestamp; absent timestamps render as `never`
    pub fn timestamp(tag: impl Into<String>, at: Option<DateTime<Utc>>) -> Self {
        match at {
            Some(at) => Self::leaf(tag, at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => Self::leaf(tag, "never"),
        }
    }

    pub fn with_child(mut self, child: DumpNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn push(&mut self, child: DumpNode) {
        self.children.push(child);
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn children(&self) -> &[DumpNode] {
        &self.children
    }

    /// First direct child with `tag`
    pub fn find(&self, tag: &str) -> Option<&DumpNode> {
        self.children.iter().find(|c| c.tag == tag)
    }

    fn write_indented(&self, out: &mut String, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match (&self.value, self.children.is_empty()) {
            (Some(value), true) => writeln!(out, "{pad}<{0}>{value}</{0}>", self.tag),
            (None, true) => writeln!(out, "{pad}<{}/>", self.tag),
            (value, false) => {
                writeln!(out, "{pad}<{}>", self.tag)?;
                if let Some(value) = value {
                    writeln!(out, "{pad}  {value}")?;
                }
                for child in &self.children {
                    child.write_indented(out, depth + 1)?;
                }
                writeln!(out, "{pad}</{}>", self.tag)
            }
        }
    }
}

impl fmt::Display for DumpNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_indented(&mut out, 0)?;
        f.write_str(&out)
    }
}

/// Lifecycle timestamps and last recorded error of a daemon
#[derive(Debug, Clone, Default)]
pub struct DaemonDiagnostics {
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<(String, DateTime<Utc>)>,
}

impl DaemonDiagnostics {
    pub fn record_error(&mut self, error: impl fmt::Display) {
        self.last_error = Some((error.to_string(), Utc::now()));
    }

    /// Append the timestamps and last error to `node`
    pub fn write_into(&self, node: &mut DumpNode) {
        node.push(DumpNode::timestamp("start-time", self.started_at));
        node.push(DumpNode::timestamp("stop-time", self.stopped_at));
        if let Some((message, at)) = &self.last_error {
            node.push(
                DumpNode::new("last-error")
                    .with_child(DumpNode::leaf("message", message))
                    .with_child(DumpNode::timestamp("time", Some(*at))),
            );
        }
    }
}
