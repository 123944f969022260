use std::fmt;
use std::io::{self, Write};

/// Why a marker appears in the diagnostics log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticStatus {
    /// A record whose key is not in the canonical index.
    Unmatched,
    /// A canonical marker missing from at least one partition.
    Incomplete,
    /// A partition listed the marker's alleles in reverse order.
    Reversed,
    /// A partition labelled the marker differently from the canonical label.
    Alias,
}

impl fmt::Display for DiagnosticStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiagnosticStatus::Unmatched => "unmatched",
            DiagnosticStatus::Incomplete => "incomplete",
            DiagnosticStatus::Reversed => "reversed",
            DiagnosticStatus::Alias => "alias",
        })
    }
}

pub fn write_diagnostics_header<W: Write>(out: &mut W) -> io::Result<()> {
    out.write_all(b"#kind\tmarker\tstatus\tnote\n")
}

/// Tab-separated per-marker notes for one value kind. Writing is a no-op when no
/// log was requested.
pub struct Diagnostics<'a> {
    kind: &'static str,
    out: Option<&'a mut dyn Write>,
}

impl<'a> Diagnostics<'a> {
    pub fn new(kind: &'static str, out: Option<&'a mut dyn Write>) -> Self {
        Self { kind, out }
    }

    pub fn record(
        &mut self,
        marker: &dyn fmt::Display,
        status: DiagnosticStatus,
        note: &dyn fmt::Display,
    ) -> io::Result<()> {
        match self.out.as_mut() {
            Some(out) => writeln!(out, "{}\t{marker}\t{status}\t{note}", self.kind),
            None => Ok(()),
        }
    }
}
