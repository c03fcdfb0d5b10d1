//! Prompt templates for reply generation, summarization and query refinement

use crate::services::SearchHit;
use crate::session::Message;
use crate::store::MemoryRecord;

/// Everything that goes into one reply prompt
#[derive(Debug, Clone, Default)]
pub struct PromptParts<'a> {
    pub recent: &'a [Message],
    pub summary: &'a str,
    pub query: &'a str,
    pub documents: &'a str,
    pub memories: &'a str,
}

/// Renders the last `n` messages as `ROLE : content` lines
pub fn format_recent(messages: &[Message], n: usize) -> String {
    let start = messages.len().saturating_sub(n);
    messages[start..]
        .iter()
        .map(|m| format!("{} : {} \n", m.role.label(), m.content))
        .collect()
}

/// Renders retrieved chunks, separated by `---`
pub fn format_hits(hits: &[SearchHit]) -> String {
    hits.iter()
        .map(|hit| {
            format!(
                "Source: {} (Page {})\n{}\n(Distance: {:.3})\n",
                hit.source, hit.page, hit.document, hit.distance
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Renders memory records one per line as `memId: context`
pub fn format_memories(records: &[MemoryRecord]) -> String {
    records
        .iter()
        .map(|r| format!("{}: {}\n", r.mem_id, r.context))
        .collect()
}

/// Reply prompt; recent turns take priority over the summary
pub fn reply_prompt(parts: &PromptParts<'_>, window: usize) -> String {
    format!(
        "Most Recent Conversation (highest priority for response):\n{}\n\n\
         Persistent Context from Summary (secondary reference):\n{}\n\n\
         User Query:\n{}\n\n\
         Context from Retrieved Files:\n{}\n\n\
         Context from Custom Memories:\n{}\n\n\
         Instructions:\n\
         1. Prioritize the recent conversation over the persistent summary when deciding how to respond.\n\
         2. Give a helpful, natural response to the user query.\n\
         3. If using provided documents for facts, cite the source and page.\n\
         4. If the query is sequential or numerical, continue it logically based on the latest messages.",
        format_recent(parts.recent, window),
        parts.summary,
        parts.query,
        parts.documents,
        parts.memories,
    )
}

/// Summarization prompt over the previous summary and the recent window
pub fn summary_prompt(previous: &str, messages: &[Message], window: usize) -> String {
    format!(
        "Previous Summary:\n{}\n\n\
         Recent Messages (up to {}):\n{}\n\n\
         Update the summary so it captures only essential context that helps continue the conversation naturally.\n\
         - Keep facts, key topics, names, ongoing goals, and important background.\n\
         - Remove specific past wording of user/AI messages unless it is still directly relevant to the main discussion.\n\
         - Do not preserve or reintroduce old behavior rules unless the user has explicitly repeated them recently.\n\
         - Keep it concise and focused but maintain enough to preserve chat history context.",
        previous,
        window,
        format_recent(messages, window),
    )
}

/// Asks for three comma-separated search queries on one line
pub fn refine_prompt(query: &str, file_names: &[&str]) -> String {
    format!(
        "You are assisting in semantic search over PDF documents.\n\
         Generate exactly 3 refined/expanded queries that better retrieve relevant info.\n\
         Return them as a single line, comma-separated, with no explanations, numbering, or newlines.\n\n\
         User query: \"{}\"\n\
         Selected file Names: {}\n",
        query,
        file_names.join(", "),
    )
}

/// Splits a refinement reply into its non-empty comma-separated parts
pub fn parse_refinement(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
