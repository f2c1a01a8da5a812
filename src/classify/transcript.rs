use crate::types::Message;

/// Separator placed between consecutive messages of a transcript.
pub const MESSAGE_DELIMITER: &str = "\n<Next_Message>\n";

/// Pick a delimiter that no message text contains. Falls back to numbered
/// variants of [`MESSAGE_DELIMITER`] on collision.
pub fn delimiter_for<'a>(texts: impl Iterator<Item = &'a str> + Clone) -> String {
    let mut candidate = MESSAGE_DELIMITER.to_string();
    let mut n = 1usize;
    while texts.clone().any(|text| text.contains(candidate.trim())) {
        candidate = format!("\n<Next_Message_{}>\n", n);
        n += 1;
    }
    candidate
}

/// Concatenate message texts in chronological order.
///
/// Messages are ordered by timestamp, ties broken by id, regardless of the
/// order they were stored or fetched in. Empty texts are skipped.
pub fn assemble(messages: &[Message]) -> String {
    let mut ordered: Vec<&Message> = messages
        .iter()
        .filter(|m| !m.text.trim().is_empty())
        .collect();
    ordered.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));

    let delimiter = delimiter_for(ordered.iter().map(|m| m.text.as_str()));
    ordered
        .iter()
        .map(|m| m.text.as_str())
        .collect::<Vec<_>>()
        .join(&delimiter)
}
