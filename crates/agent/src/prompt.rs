//! Fixed prompts of the conversational agent

/// Instructions sent ahead of every conversation
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about the \
documents in the user's storage. Use the retrieve tool to look up relevant passages before \
answering. Answer strictly from the retrieved content and mention the source file and page \
when you rely on a passage. If the documents do not contain the answer, say that you could \
not find it instead of guessing.";

/// Instructions for condensing older turns
pub const SUMMARY_PROMPT: &str = "Summarize the conversation below so it can replace the \
original messages. Keep the questions asked, the facts found in the documents with their \
sources, and any open follow-ups. Be concise and do not add information.";

/// Leading text of the summary message
pub const SUMMARY_PREFIX: &str = "Summary of the earlier conversation:";

/// Tool output when retrieval finds nothing
pub const NO_RESULTS: &str = "No relevant content was found in the documents for this query.";
