//! Backend output classification: readiness marker and noise filtering

use once_cell::sync::Lazy;
use regex::RegexSet;

/// Printed by the backend once its HTTP server accepts connections
pub const READY_MARKER: &str = "Please connect to custom endpoint at";

/// Per-tensor and per-token chatter that drowns out useful output
static NOISY_LINES: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"^llama_model_loader: - (kv|type)\s",
        r"^(llm_)?load_tensors: .*(buffer size|offload|layer\s+\d+)",
        r"^print_info: ",
        r"^(ggml_|llama_)\w+: .*(tensor|graph|buffer)\b",
        r"^\s*Processing Prompt( \[BLAS\])? \(\d+ / \d+ tokens\)",
        r"^\s*Generating \(\d+ / \d+ tokens\)",
        r"^\s*\[\d+%\]\s*$",
        r"^\.+$",
    ])
    .expect("valid noisy line patterns")
});

pub fn contains_ready_marker(line: &str) -> bool {
    line.contains(READY_MARKER)
}

pub fn is_noisy(line: &str) -> bool {
    NOISY_LINES.is_match(line)
}
