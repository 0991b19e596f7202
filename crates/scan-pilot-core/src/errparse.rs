//! Error message extraction from plugin logs
//!
//! Scanners print failures as free text: ANSI colored banners, cobra style
//! `Error:` lines, tab separated log records. Each known plugin has an ordered
//! list of patterns. The first pattern that captures something wins; when it
//! captures more than one group the groups are joined with `": "`.

use crate::error::ErrParseError;
use regex::Regex;
use std::collections::HashMap;
use std::io::Read;
use std::sync::LazyLock;

static PATTERNS: LazyLock<HashMap<&'static str, Vec<Regex>>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| -> Vec<Regex> {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("built-in error pattern must compile"))
            .collect()
    };

    HashMap::from([
        (
            "popeye",
            compile(&[
                r"(?m)panic:\s*(?:\x1b\[[0-9;]*m\s*)*(.+?)(?:\s*\x1b\[[0-9;]*m)*\s*$",
                r"(?m)Boom!\s*(?:\x1b\[[0-9;]*m\s*)*(.+?)(?:\s*\x1b\[[0-9;]*m)*\s*$",
                r#"(?m)^\{.*"level":"(?:error|fatal)".*"error":"([^"]+)""#,
            ]),
        ),
        (
            "kubescape",
            compile(&[
                r"(?m)^(?:\x1b\[[0-9;]*m)*\[(?:error|fatal)\](?:\x1b\[[0-9;]*m)*\s*(.+?)\.\s*error:\s*(.+?)\s*$",
                r"(?m)^(?:\x1b\[[0-9;]*m)*\[(?:error|fatal)\](?:\x1b\[[0-9;]*m)*\s*(.+?)\s*$",
            ]),
        ),
        (
            "marvin",
            compile(&[r"(?m)^Error:\s*(.+?)\s*$", r"(?m)^panic:\s*(.+?)\s*$"]),
        ),
        (
            "trivy",
            compile(&[r"(?m)\t(?:FATAL|ERROR)\t(?:Fatal error\t)?(.+?)\s*$"]),
        ),
    ])
});

/// Extract a single-line error message from a failed plugin's log.
pub fn parse<R: Read>(plugin: &str, mut reader: R) -> Result<String, ErrParseError> {
    let patterns = PATTERNS
        .get(plugin)
        .ok_or_else(|| ErrParseError::UnknownPlugin(plugin.to_string()))?;

    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);

    patterns
        .iter()
        .find_map(|pattern| first_match(pattern, &text))
        .ok_or_else(|| ErrParseError::NoMatch(plugin.to_string()))
}

/// Whether log extraction knows `plugin`
pub fn is_known_plugin(plugin: &str) -> bool {
    PATTERNS.contains_key(plugin)
}

fn first_match(pattern: &Regex, text: &str) -> Option<String> {
    let caps = pattern.captures(text)?;
    let groups: Vec<&str> = caps
        .iter()
        .skip(1)
        .flatten()
        .map(|m| m.as_str())
        .filter(|s| !s.is_empty())
        .collect();
    if groups.is_empty() {
        None
    } else {
        Some(groups.join(": "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    const POPEYE_PANIC: &str = "\x1b[38;5;122m ___     ___ _____   _____ \x1b[0m\n\
        \x1b[38;5;196mpanic: \x1b[0m\x1b[38;5;196mthe server has asked for the client to provide credentials\x1b[0m\n\
        \n\
        goroutine 1 [running]:\n\
        main.main()\n";

    const POPEYE_BOOM: &str = "\n\x1b[38;5;196m💥 Boom!\x1b[0m \x1b[38;5;196mscan failed: \
        Get \"https://10.0.0.1:6443/version\": dial tcp 10.0.0.1:6443: i/o timeout\x1b[0m\n";

    const POPEYE_JSON: &str = "{\"level\":\"info\",\"message\":\"starting\"}\n\
        {\"level\":\"error\",\"error\":\"unable to load kubeconfig\",\"time\":\"2024-01-01T00:00:00Z\",\"message\":\"Boot failed\"}\n";

    const KUBESCAPE_DETAIL: &str = "[info] Kubescape scanner starting\n\
        [error] failed to initialize kubernetes client. error: invalid configuration: no configuration has been provided\n";

    const KUBESCAPE_COLORED: &str = "\x1b[31m[fatal]\x1b[0m unable to retrieve policies\n";

    const MARVIN: &str = "Usage:\n  marvin scan [flags]\n\
        Error: failed to create kubernetes client: stat /etc/kubeconfig: no such file or directory\n";

    const TRIVY: &str = "2024-03-05T10:00:00.000Z\tINFO\tNode scanning is enabled\n\
        2024-03-05T10:00:01.000Z\tFATAL\tFatal error\trun error: k8s scan error: scan error: unable to load cluster\n";

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "log stream closed"))
        }
    }

    #[test]
    fn popeye_panic_strips_ansi_and_prefix() {
        let msg = parse("popeye", POPEYE_PANIC.as_bytes()).unwrap();
        assert_eq!(msg, "the server has asked for the client to provide credentials");
    }

    #[test]
    fn popeye_boom_banner() {
        let msg = parse("popeye", POPEYE_BOOM.as_bytes()).unwrap();
        assert_eq!(
            msg,
            "scan failed: Get \"https://10.0.0.1:6443/version\": dial tcp 10.0.0.1:6443: i/o timeout"
        );
    }

    #[test]
    fn popeye_json_log() {
        let msg = parse("popeye", POPEYE_JSON.as_bytes()).unwrap();
        assert_eq!(msg, "unable to load kubeconfig");
    }

    #[test]
    fn kubescape_joins_summary_and_detail() {
        let msg = parse("kubescape", KUBESCAPE_DETAIL.as_bytes()).unwrap();
        assert_eq!(
            msg,
            "failed to initialize kubernetes client: invalid configuration: no configuration has been provided"
        );
    }

    #[test]
    fn kubescape_single_line_fallback() {
        let msg = parse("kubescape", KUBESCAPE_COLORED.as_bytes()).unwrap();
        assert_eq!(msg, "unable to retrieve policies");
    }

    #[test]
    fn marvin_cobra_error() {
        let msg = parse("marvin", MARVIN.as_bytes()).unwrap();
        assert_eq!(
            msg,
            "failed to create kubernetes client: stat /etc/kubeconfig: no such file or directory"
        );
    }

    #[test]
    fn trivy_fatal_record() {
        let msg = parse("trivy", TRIVY.as_bytes()).unwrap();
        assert_eq!(
            msg,
            "run error: k8s scan error: scan error: unable to load cluster"
        );
    }

    #[test]
    fn unknown_plugin() {
        let err = parse("nmap", POPEYE_PANIC.as_bytes()).unwrap_err();
        assert!(matches!(err, ErrParseError::UnknownPlugin(p) if p == "nmap"));
        assert!(!is_known_plugin("nmap"));
    }

    #[test]
    fn no_match() {
        let err = parse("popeye", "all good\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ErrParseError::NoMatch(_)));
    }

    #[test]
    fn read_failure() {
        let err = parse("trivy", BrokenReader).unwrap_err();
        assert!(matches!(err, ErrParseError::Read(_)));
    }

    #[test]
    fn earlier_pattern_wins() {
        // both a panic line and a Boom banner; panic is tried first
        let log = format!("{}{}", POPEYE_BOOM, POPEYE_PANIC);
        let msg = parse("popeye", log.as_bytes()).unwrap();
        assert_eq!(msg, "the server has asked for the client to provide credentials");
    }
}
