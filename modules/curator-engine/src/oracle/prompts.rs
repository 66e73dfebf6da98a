use serde::Serialize;

use super::{AtomicityRequest, DecisionRequest, MergeRequest};

pub const DECISION_SYSTEM: &str = "\
You curate a team knowledge base of short experience and skill records.
You are shown a community of records that a similarity search grouped together.
Decide whether any of them say the same thing and should become one record.

- merge_all: every member is a duplicate or fragment of the same guidance.
- merge_subset: some members duplicate each other, others are distinct.
- keep_separate: the members are related but each carries distinct guidance.
- manual_review: you cannot tell without a human.

For merge decisions list every pair to merge in `merges` using the member ids
exactly as given. Never pair a record with itself. Keep `notes` to one or two
sentences explaining the decision.";

pub const ATOMICITY_SYSTEM: &str = "\
You check records in a team knowledge base for atomicity. A record is atomic
when it carries one independent unit of guidance: one problem and its fix, or
one technique. If the record bundles several independent pieces of guidance,
set `atomic` to false and return each piece as a self-contained part with its
own title and body, preserving the original wording where possible. If it is
atomic, return `atomic: true` and no parts.";

pub const SYNTHESIS_SYSTEM: &str = "\
You merge duplicate records in a team knowledge base into one record. Write a
single title and body that keep every distinct detail from the sources (steps,
versions, caveats) without repeating anything. Do not invent details that are
not in the sources.";

fn render<T: Serialize>(intro: &str, payload: &T) -> String {
    let json = serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string());
    format!("{intro}\n\n{json}")
}

pub fn decision_prompt(request: &DecisionRequest) -> String {
    render(
        &format!(
            "Round {} · category `{}` · {} members. Edge weights are similarity scores in [0, 1].",
            request.round_index,
            request.category,
            request.members.len()
        ),
        request,
    )
}

pub fn atomicity_prompt(request: &AtomicityRequest) -> String {
    render("Is this record atomic?", request)
}

pub fn synthesis_prompt(request: &MergeRequest) -> String {
    render(
        &format!("Merge these {} records into one.", request.sources.len()),
        request,
    )
}
