//! Shared CLI utilities for strata-runner binary tools.

use crate::engine::BindingApi;

/// Which runners a profiling tool drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerSelection {
    Direct,
    Graph,
    Both,
}

impl RunnerSelection {
    pub fn includes_direct(self) -> bool {
        self != RunnerSelection::Graph
    }

    pub fn includes_graph(self) -> bool {
        self != RunnerSelection::Direct
    }
}

/// Parse a `--api` value.
pub fn parse_binding_api(s: &str) -> Result<BindingApi, String> {
    match s.to_ascii_lowercase().as_str() {
        "named" => Ok(BindingApi::Named),
        "legacy" => Ok(BindingApi::Legacy),
        _ => Err(format!("Unknown binding API '{}'. Options: named, legacy", s)),
    }
}

/// Parse a `--runner` value.
pub fn parse_runner_selection(s: &str) -> Result<RunnerSelection, String> {
    match s.to_ascii_lowercase().as_str() {
        "direct" => Ok(RunnerSelection::Direct),
        "graph" => Ok(RunnerSelection::Graph),
        "both" => Ok(RunnerSelection::Both),
        _ => Err(format!("Unknown runner '{}'. Options: direct, graph, both", s)),
    }
}

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding_api() {
        assert_eq!(parse_binding_api("named"), Ok(BindingApi::Named));
        assert_eq!(parse_binding_api("Legacy"), Ok(BindingApi::Legacy));
        let err = parse_binding_api("v3").unwrap_err();
        assert!(err.contains("'v3'"));
    }

    #[test]
    fn test_parse_runner_selection() {
        let direct = parse_runner_selection("direct").unwrap();
        assert!(direct.includes_direct());
        assert!(!direct.includes_graph());
        let both = parse_runner_selection("BOTH").unwrap();
        assert!(both.includes_direct() && both.includes_graph());
        assert!(parse_runner_selection("all").is_err());
    }

    #[test]
    fn test_init_logging_disabled_does_not_panic() {
        // Just smoke-test: calling with disable=true should not panic
        init_logging(true);
    }
}
