//! Terminal formatting utilities using termimad for rich markdown rendering

use std::cell::Cell;
use termimad::*;

use crate::classify::ResolveSummary;
use crate::extract::ExtractionReport;
use crate::pipeline::{RunSummary, StatusReport};
use crate::sync::PushSummary;

thread_local! {
    /// Override for terminal detection in tests
    static FORCE_PLAIN_TEXT: Cell<bool> = const { Cell::new(false) };
}

/// Force plain text output (for testing)
pub fn set_plain_text_mode(enabled: bool) {
    FORCE_PLAIN_TEXT.with(|f| f.set(enabled));
}

pub fn create_skin() -> MadSkin {
    let mut skin = MadSkin::default();

    let mut header_style = CompoundStyle::with_fg(termimad::crossterm::style::Color::Cyan);
    header_style.add_attr(termimad::crossterm::style::Attribute::Bold);
    skin.headers[0].compound_style = header_style;
    skin.headers[1].compound_style =
        CompoundStyle::with_fg(termimad::crossterm::style::Color::Cyan);

    skin.bold.set_fg(termimad::crossterm::style::Color::White);
    skin.inline_code
        .set_fg(termimad::crossterm::style::Color::Yellow);
    skin.bullet = StyledChar::from_fg_char(termimad::crossterm::style::Color::Green, '▸');

    skin
}

/// Check if we're in a TTY (terminal) or if output is piped/redirected
pub fn is_terminal() -> bool {
    if FORCE_PLAIN_TEXT.with(|f| f.get()) {
        return false;
    }

    // Use terminal_size as a proxy for TTY detection
    terminal_size::terminal_size().is_some()
}

/// Render markdown text with the skin.
/// Falls back to plain text if not in a terminal
pub fn render_markdown(text: &str) -> String {
    if !is_terminal() {
        return text.to_string();
    }

    let skin = create_skin();
    let terminal_width = terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(80);

    skin.text(text, Some(terminal_width)).to_string()
}

/// Two-column table of counters. Markdown in a terminal, `name: value`
/// lines otherwise.
fn render_counts(title: &str, rows: &[(&str, String)]) -> String {
    if !is_terminal() {
        let mut output = format!("{}:\n", title);
        for (name, value) in rows {
            output.push_str(&format!("  {}: {}\n", name, value));
        }
        return output;
    }

    let mut table = format!("## {}\n\n|:-|-:|\n| | |\n|-|-|\n", title);
    for (name, value) in rows {
        table.push_str(&format!("| {} | {} |\n", name, value));
    }
    table.push_str("|-|-|\n");
    render_markdown(&table)
}

fn id_list(title: &str, ids: &[String]) -> Option<String> {
    if ids.is_empty() {
        return None;
    }
    let shown: Vec<String> = ids.iter().take(20).cloned().collect();
    let mut out = render_list(title, shown);
    if ids.len() > 20 {
        out.push_str(&format!("  ... {} more\n", ids.len() - 20));
    }
    Some(out)
}

pub fn render_extraction(report: &ExtractionReport) -> String {
    let mut out = render_counts(
        "Extraction",
        &[
            ("fetched", report.fetched.to_string()),
            ("stored", report.stored.to_string()),
            ("messages stored", report.messages_stored.to_string()),
            ("rejected", report.rejected.to_string()),
            ("failed conversations", report.failed_ids.len().to_string()),
            ("failed chunks", report.chunk_failures.len().to_string()),
        ],
    );
    if let Some(list) = id_list("Failed conversations", &report.failed_ids) {
        out.push_str(&list);
    }
    if !report.chunk_failures.is_empty() {
        let items = report
            .chunk_failures
            .iter()
            .map(|f| format!("{}: {}", f.filter.describe(), f.error))
            .collect();
        out.push_str(&render_list("Failed chunks (re-run with the same filter)", items));
    }
    out
}

pub fn render_resolution(summary: &ResolveSummary) -> String {
    let mut out = render_counts(
        "Resolution",
        &[
            ("requested", summary.requested.to_string()),
            ("warehouse", summary.warehouse_found.to_string()),
            ("api override", summary.api_override_found.to_string()),
            ("ai classified", summary.ai_classified.to_string()),
            ("unresolved", summary.unresolved.to_string()),
            ("kept existing", summary.kept.to_string()),
            ("excluded", summary.excluded.to_string()),
            ("failed", summary.failed.to_string()),
            ("written", summary.applied.to_string()),
            ("unchanged", summary.unchanged.to_string()),
            ("superseded", summary.superseded.to_string()),
        ],
    );
    if let Some(list) = id_list("Failed conversations", &summary.failed_ids) {
        out.push_str(&list);
    }
    out
}

pub fn render_push(title: &str, summary: &PushSummary) -> String {
    let mut out = render_counts(
        title,
        &[
            ("processed", summary.processed.to_string()),
            ("succeeded", summary.succeeded.to_string()),
            ("failed", summary.failed.to_string()),
            ("skipped", summary.skipped.to_string()),
        ],
    );
    if let Some(list) = id_list("Failed conversations", &summary.failed_ids) {
        out.push_str(&list);
    }
    out
}

pub fn render_status(report: &StatusReport) -> String {
    let mut rows = vec![
        ("conversations", report.conversations.to_string()),
        ("messages", report.messages.to_string()),
        ("users", report.users.to_string()),
        ("customers", report.customers.to_string()),
    ];
    for (state, count) in &report.lifecycle {
        rows.push((state.as_str(), count.to_string()));
    }
    let mut out = render_counts("Store", &rows);

    let provenance: Vec<(&str, String)> = report
        .provenance
        .iter()
        .map(|(p, count)| (p.as_str(), count.to_string()))
        .collect();
    if !provenance.is_empty() {
        out.push_str(&render_counts("Provenance", &provenance));
    }
    out
}

pub fn render_run(summary: &RunSummary) -> String {
    let mut out = format!("Run {}\n", summary.run_id);
    out.push_str(&render_extraction(&summary.extraction));
    out.push_str(&render_resolution(&summary.resolution));
    out.push_str(&render_push("Push", &summary.push));
    out.push_str(&render_counts(
        "Remote calls",
        &[
            ("pages fetched", summary.counters.pages_fetched.to_string()),
            ("warehouse queries", summary.counters.warehouse_queries.to_string()),
            ("override lookups", summary.counters.override_lookups.to_string()),
            ("classifier calls", summary.counters.classifier_calls.to_string()),
            ("validation failures", summary.counters.validation_failures.to_string()),
            ("updates sent", summary.counters.remote_updates.to_string()),
        ],
    ));
    out
}

/// Render a formatted list with custom bullet styling
pub fn render_list(title: &str, items: Vec<String>) -> String {
    if !is_terminal() {
        let mut output = format!("{}:\n", title);
        for item in items {
            output.push_str(&format!("  - {}\n", item));
        }
        return output;
    }

    let mut formatted = format!("## {}\n\n", title);
    for item in items {
        formatted.push_str(&format!("- {}\n", item));
    }
    render_markdown(&formatted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_push_plain() {
        set_plain_text_mode(true);
        let summary = PushSummary {
            processed: 10,
            succeeded: 9,
            failed: 1,
            skipped: 0,
            failed_ids: vec!["c4".to_string()],
        };
        let out = render_push("Push", &summary);
        assert!(out.contains("succeeded: 9"));
        assert!(out.contains("failed: 1"));
        assert!(out.contains("- c4"));
    }

    #[test]
    fn test_render_list_plain() {
        set_plain_text_mode(true);
        let out = render_list("Excluded", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(out, "Excluded:\n  - a\n  - b\n");
    }
}
