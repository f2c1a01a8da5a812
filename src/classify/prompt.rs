use super::taxonomy::Taxonomy;

pub fn category_prompt(taxonomy: &Taxonomy, transcript: &str) -> String {
    format!(
        r#"Classify the support conversation below.

Pick exactly one category and one of its sub-categories from this list:
{categories}

Reply with a JSON object: {{"category": "...", "sub_category": "...", "reasoning": "..."}}

Conversation:
{transcript}"#,
        categories = taxonomy.render_categories(),
        transcript = transcript,
    )
}

pub fn resolution_prompt(taxonomy: &Taxonomy, transcript: &str) -> String {
    format!(
        r#"Decide how the support conversation below was resolved.

Pick exactly one resolution from this list:
{resolutions}

Reply with a JSON object: {{"resolution": "...", "reasoning": "..."}}

Conversation:
{transcript}"#,
        resolutions = taxonomy.render_resolutions(),
        transcript = transcript,
    )
}

/// Re-ask after an invalid answer, quoting what was wrong with it.
pub fn corrective(original: &str, previous_reply: &str, problem: &str) -> String {
    format!(
        "{original}\n\nYour previous reply was rejected: {problem}.\nPrevious reply: {previous}\nAnswer again using only values from the list above.",
        original = original,
        problem = problem,
        previous = previous_reply.trim(),
    )
}
