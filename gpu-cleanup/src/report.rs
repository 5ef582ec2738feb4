//! Run report printed to stdout

use anyhow::Result;

use gpu_cleanup_core::ReconcileSummary;

use crate::cli::OutputFormat;

/// One line per node followed by the summary line
pub fn render_text(summary: &ReconcileSummary) -> String {
    let mut out = String::new();
    for report in &summary.nodes {
        out.push_str(&format!("Node: {} {}\n", report.node, report.outcome));
    }
    out.push_str(&format!("Summary: {}\n", summary));
    out
}

pub fn render_json(summary: &ReconcileSummary) -> Result<String> {
    Ok(serde_json::to_string_pretty(summary)?)
}

/// Print the report in the requested format
pub fn print(summary: &ReconcileSummary, format: OutputFormat) -> Result<()> {
    let rendered = match format {
        OutputFormat::Text => render_text(summary),
        OutputFormat::Json => render_json(summary)? + "\n",
    };
    print!("{}", rendered);
    Ok(())
}
