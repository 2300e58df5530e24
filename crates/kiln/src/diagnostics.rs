//! Best-effort parsing of GCC/Clang diagnostics
//!
//! Recognized lines:
//!
//! - `main.c:3:5: error: expected ';' before '}' token`
//! - `main.c:3: warning: ...` (no column)
//! - `/usr/bin/ld: main.o: in function 'main': undefined reference to 'foo'`
//! - `collect2: error: ld returned 1 exit status`
//!
//! Anything else (include stacks, caret lines, source excerpts) is skipped.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static POSITIONED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>fatal error|error|warning|note):\s*(?P<msg>.*)$",
    )
    .expect("diagnostic pattern is valid")
});

static TOOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<tool>(?:\S*/)?(?:ld|collect2|ld\.\w+))(?::\s*(?P<sev>fatal error|error|warning))?:\s*(?P<msg>.*)$")
        .expect("linker pattern is valid")
});

static UNDEFINED_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\S.*:\s*(?P<msg>undefined reference to .*)$")
        .expect("undefined reference pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    fn parse(s: &str) -> Self {
        match s {
            "warning" => Severity::Warning,
            "note" => Severity::Note,
            _ => Severity::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        }
    }
}

/// One compiler or linker message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// File the compiler attributed the message to; `None` for linker and
    /// driver messages
    pub file: Option<String>,
    pub severity: Severity,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            file: None,
            severity: Severity::Error,
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{file}:")?;
        }
        match (self.line, self.column) {
            (Some(line), Some(col)) => write!(f, "{line}:{col}: ")?,
            (Some(line), None) => write!(f, "{line}: ")?,
            _ => {}
        }
        write!(f, "{}: {}", self.severity.as_str(), self.message)
    }
}

/// Parse compiler output into diagnostics. Returns an empty list when no line
/// looks like a diagnostic; callers keep the raw text for that case.
pub fn parse(output: &str) -> Vec<Diagnostic> {
    output.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Diagnostic> {
    let line = line.trim_end();

    if let Some(caps) = POSITIONED.captures(line) {
        return Some(Diagnostic {
            file: Some(caps["file"].to_owned()),
            severity: Severity::parse(&caps["sev"]),
            line: caps["line"].parse().ok(),
            column: caps.name("col").and_then(|c| c.as_str().parse().ok()),
            message: caps["msg"].to_owned(),
        });
    }

    if let Some(caps) = UNDEFINED_REFERENCE.captures(line) {
        return Some(Diagnostic::error(&caps["msg"]));
    }

    if let Some(caps) = TOOL.captures(line) {
        let severity = caps
            .name("sev")
            .map_or(Severity::Error, |s| Severity::parse(s.as_str()));
        return Some(Diagnostic {
            file: None,
            severity,
            line: None,
            column: None,
            message: caps["msg"].to_owned(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn parses_positioned_error() {
        let out = "main.c: In function 'main':\n\
                   main.c:3:5: error: expected ';' before '}' token\n    \
                   3 |     return 0\n      |             ^\n";
        let diags = parse(out);
        assert_eq!(
            diags,
            vec![Diagnostic {
                file: Some("main.c".to_owned()),
                severity: Severity::Error,
                line: Some(3),
                column: Some(5),
                message: "expected ';' before '}' token".to_owned(),
            }]
        );
        assert_eq!(
            diags[0].to_string(),
            "main.c:3:5: error: expected ';' before '}' token"
        );
    }

    #[test]
    fn parses_warning_and_note() {
        let out = "main.c:2:9: warning: unused variable 'x' [-Wunused-variable]\n\
                   main.c:1:1: note: declared here\n";
        let diags = parse(out);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert_eq!(diags[1].severity, Severity::Note);
        assert!(!diags[0].is_error());
    }

    #[test]
    fn parses_line_without_column() {
        let diags = parse("main.c:7: error: old style diagnostic\n");
        assert_eq!(diags[0].line, Some(7));
        assert_eq!(diags[0].column, None);
        assert_eq!(diags[0].to_string(), "main.c:7: error: old style diagnostic");
    }

    #[test]
    fn fatal_error_is_error() {
        let diags = parse("main.c:1:10: fatal error: nope.h: No such file or directory\n");
        assert_eq!(diags[0].severity, Severity::Error);
        assert_eq!(diags[0].message, "nope.h: No such file or directory");
    }

    #[test]
    fn parses_linker_errors() {
        let out = "/usr/bin/ld: /tmp/ccX.o: in function `main':\n\
                   main.c:(.text+0x5): undefined reference to `foo'\n\
                   collect2: error: ld returned 1 exit status\n";
        let diags = parse(out);
        assert_eq!(diags.len(), 3);
        assert!(diags.iter().all(Diagnostic::is_error));
        assert_eq!(diags[1].message, "undefined reference to `foo'");
        assert_eq!(diags[2].message, "ld returned 1 exit status");
        assert_eq!(diags[2].to_string(), "error: ld returned 1 exit status");
    }

    #[test]
    fn unrecognized_output_yields_nothing() {
        assert!(parse("Segmentation fault\nsomething odd\n").is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn keeps_header_file_names() {
        let out = "main.c:4:12: warning: passing argument 1 of 'puts' makes pointer from integer without a cast\n\
                   /usr/include/stdio.h:356:12: note: expected 'const char *' but argument is of type 'int'\n";
        let diags = parse(out);
        assert_eq!(diags[0].file.as_deref(), Some("main.c"));
        assert_eq!(diags[1].file.as_deref(), Some("/usr/include/stdio.h"));
        assert_eq!(
            diags[1].to_string(),
            "/usr/include/stdio.h:356:12: note: expected 'const char *' but argument is of type 'int'"
        );
    }

    #[test]
    fn parse_is_deterministic() {
        let out = "main.c:3:5: error: a\nmain.c:4:1: warning: b\n";
        assert_eq!(parse(out), parse(out));
    }

    proptest! {
        #[test]
        fn never_panics(output in "\\PC{0,400}") {
            let _ = parse(&output);
        }

        #[test]
        fn positioned_roundtrip(line in 1u32..100_000, col in 1u32..500, msg in "[a-z';][a-z ';]{0,39}") {
            let text = format!("main.c:{line}:{col}: error: {msg}");
            let diags = parse(&text);
            prop_assert_eq!(diags.len(), 1);
            prop_assert_eq!(diags[0].line, Some(line));
            prop_assert_eq!(diags[0].column, Some(col));
            prop_assert_eq!(diags[0].message.as_str(), msg.trim_end());
        }
    }
}
