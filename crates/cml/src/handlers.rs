//! Error handler interfaces the host installs on the engine.
//!
//! Parse-time diagnostics and runtime failures are both surfaced through
//! callbacks rather than return values, so a host can route them to its own
//! UI, logs, or test collectors. Prefab implementations write to any
//! `io::Write` sink; the collecting handler records events for inspection,
//! which is what the test suites use.

use std::io::Write;

use crate::error::{ExceptInfo, NativeError};

/// Severity of a parse diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseEventKind {
    Info,
    Warning,
    Error,
}

/// One recorded parse diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEvent {
    pub kind: ParseEventKind,
    pub text: String,
    pub line: u32,
    pub col: u32,
    pub class_path: String,
}

/// Receiver for parse-time diagnostics.
pub trait ParseErrorHandler {
    /// An ordinary diagnostic at a source position.
    fn event(&mut self, kind: ParseEventKind, text: &str, line: u32, col: u32, class_path: &str);

    /// A native error was caught during the parse.
    fn native_exception(&mut self, error: &NativeError, line: u32, col: u32, class_path: &str) {
        self.event(ParseEventKind::Error, &error.to_string(), line, col, class_path);
    }

    /// Something unidentifiable was caught during the parse.
    fn unknown_exception(&mut self, line: u32, col: u32, class_path: &str) {
        self.event(ParseEventKind::Error, "unknown exception", line, col, class_path);
    }
}

/// Parse handler that formats each event onto a stream.
#[derive(Debug)]
pub struct StreamParseErrorHandler<W: Write> {
    out: W,
}

impl<W: Write> StreamParseErrorHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> ParseErrorHandler for StreamParseErrorHandler<W> {
    fn event(&mut self, kind: ParseEventKind, text: &str, line: u32, col: u32, class_path: &str) {
        let tag = match kind {
            ParseEventKind::Info => "info",
            ParseEventKind::Warning => "warning",
            ParseEventKind::Error => "error",
        };
        let _ = writeln!(self.out, "{class_path}({line}.{col}): {tag}: {text}");
    }
}

/// Parse handler that collects events for later inspection.
#[derive(Debug, Default)]
pub struct CollectParseErrors {
    events: Vec<ParseEvent>,
}

impl CollectParseErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[ParseEvent] {
        &self.events
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.events.iter().filter(|e| e.kind == ParseEventKind::Error).count()
    }

    /// Whether any collected diagnostic mentions the text.
    #[must_use]
    pub fn mentions(&self, needle: &str) -> bool {
        self.events.iter().any(|e| e.text.contains(needle))
    }
}

impl ParseErrorHandler for CollectParseErrors {
    fn event(&mut self, kind: ParseEventKind, text: &str, line: u32, col: u32, class_path: &str) {
        self.events.push(ParseEvent {
            kind,
            text: text.to_owned(),
            line,
            col,
            class_path: class_path.to_owned(),
        });
    }
}

/// Receiver for runtime failures that escape macro handling.
pub trait RuntimeErrorHandler {
    /// A native error with no macro-visible equivalent.
    fn exception(&mut self, error: &NativeError);

    /// A macro-level exception, reported per the engine's report mode:
    /// at throw, or only once it goes unhandled.
    fn macro_exception(&mut self, thrown: &ExceptInfo);

    /// Something unidentifiable surfaced from a host callback.
    fn unknown_exception(&mut self) {}
}

/// Runtime handler that formats failures onto a stream.
#[derive(Debug)]
pub struct StreamRuntimeErrorHandler<W: Write> {
    out: W,
}

impl<W: Write> StreamRuntimeErrorHandler<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> RuntimeErrorHandler for StreamRuntimeErrorHandler<W> {
    fn exception(&mut self, error: &NativeError) {
        let _ = writeln!(self.out, "native error: {error}");
    }

    fn macro_exception(&mut self, thrown: &ExceptInfo) {
        let _ = writeln!(
            self.out,
            "macro exception: {}.{} at {} line {}: {}",
            thrown.class_path, thrown.name, thrown.class_path, thrown.line, thrown.text
        );
    }

    fn unknown_exception(&mut self) {
        let _ = writeln!(self.out, "unknown exception");
    }
}

/// Runtime handler that collects failures for later inspection.
#[derive(Debug, Default)]
pub struct CollectRuntimeErrors {
    pub native: Vec<NativeError>,
    pub thrown: Vec<ExceptInfo>,
}

impl CollectRuntimeErrors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuntimeErrorHandler for CollectRuntimeErrors {
    fn exception(&mut self, error: &NativeError) {
        self.native.push(error.clone());
    }

    fn macro_exception(&mut self, thrown: &ExceptInfo) {
        self.thrown.push(thrown.clone());
    }
}
