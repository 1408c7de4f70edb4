/// Context assembly and prompt composition.
use crate::error::AppError;
use crate::index::Retrieve;
use crate::model::ScoredChunk;

const MATH_MARKUP_RULES: &str = r"When writing mathematical expressions, always:
- Use \( ... \) for inline math
- Use \[ ... \] for block math (e.g., full equations)
- Do not use dollar signs ($) for LaTeX

Ensure the math is LaTeX-formatted correctly so it renders properly on the frontend.";

/// Join retrieved chunk texts into one context string.
///
/// Syllabus text comes first, then notes text, separated by a blank line. Within each
/// block chunks are joined with `\n` from highest to lowest score; an empty block is an
/// empty string.
pub fn assemble_context(results: &[ScoredChunk]) -> String {
    let mut ranked: Vec<&ScoredChunk> = results.iter().collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let block = |syllabus: bool| {
        ranked
            .iter()
            .filter(|r| r.chunk.source.is_syllabus() == syllabus)
            .map(|r| r.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!("{}\n\n{}", block(true), block(false))
}

/// Retrieve the top `k` chunks for `query` and assemble them.
pub async fn retrieve_context<R: Retrieve>(index: &R, query: &str, k: usize) -> Result<String, AppError> {
    let results = index.retrieve_top_k(query, k).await?;
    tracing::debug!(query, retrieved = results.len(), "retrieved context");
    Ok(assemble_context(&results))
}

/// Wrap context and the verbatim question in the tutoring instructions.
pub fn compose_prompt(context: &str, question: &str) -> String {
    format!(
        "You are an expert tutor.\n\n\
         If the question is multiple-choice, answer with the letter and a concise explanation.\n\
         If the question is open-ended or complex, provide a clear, step-by-step, \
         multi-paragraph explanation.\n\n\
         {MATH_MARKUP_RULES}\n\n\
         Context:\n{context}\n\n\
         Question:\n{question}\n"
    )
}

/// Ask for `count` numbered multiple-choice questions on `topic`, grounded in `context`.
pub fn compose_practice_prompt(context: &str, topic: &str, count: usize) -> String {
    format!(
        "You are an expert tutor writing practice questions.\n\n\
         Write exactly {count} multiple-choice questions on {topic}, using only the context below.\n\
         Start each question on a new line with its number followed by a dot (1. 2. 3. ...).\n\
         After each question list four options labelled A to D on separate lines, then a line \
         \"Answer: <letter>\".\n\
         Do not write anything before the first question.\n\n\
         {MATH_MARKUP_RULES}\n\n\
         Context:\n{context}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chunk, SourceTag};

    fn scored(source: SourceTag, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                source,
                text: text.to_string(),
                index: 0,
                start: 0,
            },
            score,
        }
    }

    fn notes(text: &str, score: f32) -> ScoredChunk {
        scored(SourceTag::Notes("n.mmd".to_string()), text, score)
    }

    fn syllabus(text: &str, score: f32) -> ScoredChunk {
        scored(SourceTag::Syllabus, text, score)
    }

    #[test]
    fn test_syllabus_precedes_notes_in_score_order() {
        let results = vec![
            notes("note-high", 0.9),
            syllabus("syl-low", 0.2),
            notes("note-low", 0.1),
            syllabus("syl-high", 0.8),
        ];
        assert_eq!(
            assemble_context(&results),
            "syl-high\nsyl-low\n\nnote-high\nnote-low"
        );
    }

    #[test]
    fn test_empty_partitions() {
        assert_eq!(assemble_context(&[notes("only notes", 0.5)]), "\n\nonly notes");
        assert_eq!(assemble_context(&[syllabus("only syllabus", 0.5)]), "only syllabus\n\n");
        assert_eq!(assemble_context(&[]), "\n\n");
    }

    #[test]
    fn test_prompt_contains_context_and_verbatim_question() {
        let prompt = compose_prompt("syl\n\nnote", "What is 2 + 2?  ");
        assert!(prompt.starts_with("You are an expert tutor."));
        assert!(prompt.contains("answer with the letter and a concise explanation"));
        assert!(prompt.contains(r"Use \( ... \) for inline math"));
        assert!(prompt.contains(r"Use \[ ... \] for block math"));
        assert!(prompt.contains("Context:\nsyl\n\nnote\n\nQuestion:\nWhat is 2 + 2?  \n"));
    }

    #[test]
    fn test_practice_prompt_requests_numbered_items() {
        let prompt = compose_practice_prompt("ctx", "kinematics", 7);
        assert!(prompt.contains("Write exactly 7 multiple-choice questions on kinematics"));
        assert!(prompt.contains("(1. 2. 3. ...)"));
        assert!(prompt.ends_with("Context:\nctx\n"));
    }

    #[tokio::test]
    async fn test_retrieve_context_uses_top_k() {
        use crate::retriever::tests::MockIndex;

        let index = MockIndex {
            chunks: vec![
                Chunk {
                    source: SourceTag::Notes("a.mmd".to_string()),
                    text: "first note".to_string(),
                    index: 0,
                    start: 0,
                },
                Chunk {
                    source: SourceTag::Syllabus,
                    text: "syllabus point".to_string(),
                    index: 0,
                    start: 0,
                },
                Chunk {
                    source: SourceTag::Syllabus,
                    text: "not retrieved".to_string(),
                    index: 1,
                    start: 0,
                },
            ],
        };
        let context = retrieve_context(&index, "anything", 2).await.unwrap();
        assert_eq!(context, "syllabus point\n\nfirst note");
    }
}
