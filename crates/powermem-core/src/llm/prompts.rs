//! Default prompt text for every LLM-driven component, overridable per field
//! via [`crate::config::PromptsConfig`] (spec.md §6).

pub const FACT_EXTRACTION: &str = r#"You extract standalone factual memories from a conversation turn.

Given the input text, return a JSON object of the form:
{"facts": ["fact one", "fact two", ...]}

Rules:
- Each fact must be a self-contained statement that makes sense without the original context.
- Do not invent facts that are not stated or strongly implied by the input.
- Omit greetings, filler, and meta-commentary about the conversation itself.
- If no facts are present, return {"facts": []}.
Respond with only the JSON object."#;

pub const UPDATE_MEMORY: &str = r#"You decide how a newly extracted fact should be reconciled against the most
similar existing memories.

Given the new fact and a list of candidate existing memories (id and content), return a JSON object:
{"action": "ADD" | "UPDATE" | "DELETE" | "NONE", "memory_id": "<id or null>", "new_content": "<string or null>", "reasoning": "<short justification>"}

Rules:
- ADD: the fact is new information, unrelated to any candidate.
- UPDATE: the fact supersedes or refines a specific candidate; set memory_id to that candidate's id and new_content to the merged statement.
- DELETE: the fact contradicts and invalidates a specific candidate; set memory_id to that candidate's id.
- NONE: the fact is already fully covered by a candidate; no change is needed.
Respond with only the JSON object."#;

pub const IMPORTANCE_EVALUATION: &str = r#"You score how important a memory is to retain.

Given the memory content, return a JSON object:
{"score": <float 0.0-1.0>, "novelty": <float 0.0-1.0>, "relevance": <float 0.0-1.0>, "emotional_weight": <float 0.0-1.0>}

Score higher for identity facts, stated preferences, commitments, and emotionally charged statements.
Score lower for small talk, transient state, or information likely to go stale within days.
Respond with only the JSON object."#;

pub const EXTRACT_RELATIONS: &str = r#"You extract subject-relation-object triples describing entities and their
relationships from the input text.

Return a JSON object:
{"triples": [{"subject": "...", "relation": "...", "object": "..."}, ...]}

Rules:
- Use short, lowercase, snake_case relation names (e.g. "works_at", "likes", "located_in").
- Only extract relations explicitly stated or strongly implied.
- If none are present, return {"triples": []}.
Respond with only the JSON object."#;

pub const UPDATE_GRAPH: &str = r#"You decide whether a newly observed relation triple supersedes an existing
one between the same two entities.

Given the new triple and the existing relation between the same entities, return a JSON object:
{"classification": "SUPERSEDES" | "COEXISTS", "reasoning": "<short justification>"}

SUPERSEDES means the new relation replaces the old one (e.g. a changed job, a changed location).
COEXISTS means both relations can be true about the entities at the same time.
Respond with only the JSON object."#;

pub const DELETE_RELATIONS: &str = r#"You decide which existing relations, if any, are directly contradicted by
the input text and should be removed.

Given the input text and a list of candidate relations (id, subject, relation, object), return a JSON object:
{"delete_ids": ["<id>", ...]}

Only include relations that are explicitly contradicted. If none are contradicted, return {"delete_ids": []}.
Respond with only the JSON object."#;

pub const PROFILE_CONSOLIDATION: &str = r#"You maintain a short natural-language profile of a user, distilled from
their stored memories.

Given the current profile (if any) and a list of recently added or updated facts, produce an updated profile of at
most roughly 500 tokens along with a short list of topics it touches. Return a JSON object:
{"profile_text": "...", "topics": ["...", ...]}
Respond with only the JSON object, with no text outside it."#;

/// Returns the configured override if present, otherwise the built-in default.
pub fn resolve<'a>(configured: &'a Option<String>, default: &'static str) -> &'a str {
    configured.as_deref().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_override() {
        let configured = Some("custom prompt".to_string());
        assert_eq!(resolve(&configured, FACT_EXTRACTION), "custom prompt");
    }

    #[test]
    fn resolve_falls_back_to_default() {
        assert_eq!(resolve(&None, FACT_EXTRACTION), FACT_EXTRACTION);
    }
}
