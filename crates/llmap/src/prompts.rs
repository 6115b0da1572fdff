//! Prompt construction for every stage.
//!
//! The system message carries everything shared by all files of one stage
//! for one question: instructions, the question and the response format.
//! It is byte-identical across files, so providers can serve it from their
//! prompt cache. File-specific content goes in the following user message,
//! which always starts with a `FILE: <path>` line.

use llmap_core::chunk::SourceChunk;
use llmap_core::model::{Message, Prompt};
use llmap_core::models::{FileId, Question};

const VERDICT_FORMAT: &str = "\
Respond in exactly this format:

VERDICT: RELEVANT or IRRELEVANT
SCORE: <integer 0-10, how useful the file is for answering the question>
EXPLANATION:
<a short explanation of what the file does that bears on the question>

When the verdict is RELEVANT, follow the explanation with the most relevant
code sections, each as:

SNIPPET <first line>-<last line>
WHY: <why this code matters for the question>
```
<the code, copied exactly>
```

Write nothing after the last snippet.";

const RANKING_FORMAT: &str = "\
Respond with one line per file, most useful first:

RANK <n>: <path exactly as given>
WHY: <one sentence>

List every file you were given.";

/// Prefix each line with its 1-based number, starting after `offset` lines.
pub fn numbered(text: &str, offset: usize) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for (i, line) in text.lines().enumerate() {
        out.push_str(&format!("{:>5} | {}\n", offset + i + 1, line));
    }
    out
}

fn question_block(question: &Question) -> String {
    format!("Question:\n```\n{}\n```", question.as_str())
}

/// Stage 1: the structural skeleton of one file.
pub fn skeleton_prompt(question: &Question, file: &FileId, skeleton: &str) -> Prompt {
    let system = format!(
        "You triage source files for relevance to a question about a codebase.\n\
         You will see the skeleton of one file: its declarations and signatures with \
         method bodies removed.\n\n\
         {}\n\n\
         Answer IRRELEVANT only when the skeleton clearly shows the file cannot help \
         answer the question. If the file looks relevant, or if the method bodies could \
         change your answer, answer RELEVANT; the full source will be checked next. \
         Do not include snippets at this stage.\n\n\
         {}",
        question_block(question),
        VERDICT_FORMAT
    );
    let user = format!("FILE: {}\nSKELETON:\n{}", file, skeleton);
    Prompt::new(vec![Message::system(system), Message::user(user)])
}

/// Stage 2: the full source of one file, or one chunk of it.
///
/// Lines are numbered in file coordinates so snippet ranges refer to the
/// file even when chunked. `prior` is the stage-1 explanation, if any.
pub fn full_source_prompt(
    question: &Question,
    file: &FileId,
    chunk: &SourceChunk,
    chunk_count: usize,
    prior: Option<&str>,
) -> Prompt {
    let system = format!(
        "You evaluate source code for relevance to a question about a codebase.\n\
         You will see the full source of one file, with line numbers. Large files are \
         shown in parts.\n\n\
         {}\n\n\
         Give an overall summary as the explanation. Prefer snippets that cover whole \
         functions, classes or methods rather than isolated lines, and use the line \
         numbers shown. Do not copy the line numbers into the code.\n\n\
         {}",
        question_block(question),
        VERDICT_FORMAT
    );

    let mut user = format!("FILE: {}\n", file);
    if chunk_count > 1 {
        user.push_str(&format!("PART: {} of {}\n", chunk.index + 1, chunk_count));
    }
    if let Some(prior) = prior.filter(|p| !p.trim().is_empty()) {
        user.push_str(&format!("SKELETON NOTES: {}\n", prior.trim()));
    }
    user.push_str("SOURCE:\n");
    user.push_str(&numbered(&chunk.text, chunk.line_offset));
    Prompt::new(vec![Message::system(system), Message::user(user)])
}

/// Stage 3: the combined stage-2 analyses of a group of files.
pub fn refine_prompt(question: &Question, combined: &str) -> Prompt {
    let system = format!(
        "You rank source files by how useful they are for answering a question about a \
         codebase.\n\
         You will see, for each file, an analysis and the relevant code sections. Each \
         file starts with a `FILE: <path>` line.\n\n\
         {}\n\n\
         {}",
        question_block(question),
        RANKING_FORMAT
    );
    Prompt::new(vec![Message::system(system), Message::user(combined.to_string())])
}

/// Follow-up after a reply that did not match the expected format.
pub fn format_correction(error: &str) -> String {
    format!(
        "Your reply could not be parsed: {}.\n\
         Please answer again using exactly the requested format and nothing else.",
        error
    )
}

/// Follow-up after an empty or undecodable reply.
pub fn empty_reply_correction() -> String {
    "Your reply was empty. Please answer using exactly the requested format.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmap_core::chunk::chunk_lines;

    #[test]
    fn test_system_prefix_is_shared_across_files() {
        let q = Question::new("Where is the database connection configured?");
        let a = skeleton_prompt(&q, &FileId::new("A.java"), "class A {");
        let b = skeleton_prompt(&q, &FileId::new("B.java"), "class B {");
        assert_eq!(a.messages()[0], b.messages()[0]);
        assert!(a.messages()[0].content.contains(q.as_str()));
        assert!(a.messages()[1].content.starts_with("FILE: A.java\n"));

        let chunk = &chunk_lines("x = 1\n", 100)[0];
        let c = full_source_prompt(&q, &FileId::new("a.py"), chunk, 1, None);
        let d = full_source_prompt(&q, &FileId::new("b.py"), chunk, 1, Some("notes"));
        assert_eq!(c.messages()[0], d.messages()[0]);
        assert_ne!(a.messages()[0], c.messages()[0]);
    }

    #[test]
    fn test_full_source_numbers_lines_in_file_coordinates() {
        let text = "a\nb\nc\nd\n";
        let chunks = chunk_lines(text, 4);
        let p = full_source_prompt(&Question::new("q"), &FileId::new("f.py"), &chunks[1], chunks.len(), None);
        let user = &p.messages()[1].content;
        assert!(user.contains(&format!("PART: 2 of {}", chunks.len())));
        assert!(user.contains("    3 | c"));
        assert!(!user.contains("    1 | a"));
    }

    #[test]
    fn test_prior_explanation_included() {
        let chunk = &chunk_lines("x", 100)[0];
        let p = full_source_prompt(&Question::new("q"), &FileId::new("f.py"), chunk, 1, Some("opens pool"));
        assert!(p.messages()[1].content.contains("SKELETON NOTES: opens pool"));
        assert!(!p.messages()[1].content.contains("PART:"));
    }
}
