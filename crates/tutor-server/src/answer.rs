/// Best-effort extraction of numbered items from a completed answer.
///
/// Models do not always follow the requested numbering, so an answer that yields nothing
/// here is an expected outcome rather than a failure.
use regex::Regex;
use tracing::warn;

use crate::model::StructuredItem;

/// Split an answer on line-leading `<digits>. ` markers.
///
/// Text before the first marker is ignored. Markers followed by no content are logged
/// and skipped.
pub fn parse_numbered_answer(answer: &str) -> Vec<StructuredItem> {
    let marker_re = Regex::new(r"(?m)^\s*(\d+)\.\s+").expect("valid regex");

    let markers: Vec<(usize, usize, &str)> = marker_re
        .captures_iter(answer)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let number = caps.get(1)?;
            Some((whole.start(), whole.end(), number.as_str()))
        })
        .collect();

    let mut items = Vec::with_capacity(markers.len());
    for (i, (_, content_start, number)) in markers.iter().enumerate() {
        let content_end = markers
            .get(i + 1)
            .map_or(answer.len(), |(next_start, _, _)| *next_start);
        let content = answer[*content_start..content_end].trim();
        if content.is_empty() {
            warn!(question_number = %number, "skipping empty numbered segment");
            continue;
        }
        items.push(StructuredItem {
            question_number: (*number).to_string(),
            content: content.to_string(),
        });
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: &str, content: &str) -> StructuredItem {
        StructuredItem {
            question_number: n.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_two_numbered_questions() {
        let items = parse_numbered_answer("1. What is X?\n2. What is Y?");
        assert_eq!(items, vec![item("1", "What is X?"), item("2", "What is Y?")]);
    }

    #[test]
    fn test_no_markers_is_empty() {
        assert!(parse_numbered_answer("Velocity is displacement over time.").is_empty());
        assert!(parse_numbered_answer("").is_empty());
    }

    #[test]
    fn test_preamble_ignored_and_multiline_content_kept() {
        let answer = "Here are your questions:\n\n\
                      1. A ball is dropped from 5 m.\n   Find its speed at impact.\n\
                      2. State Newton's third law.\n";
        let items = parse_numbered_answer(answer);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0],
            item("1", "A ball is dropped from 5 m.\n   Find its speed at impact.")
        );
        assert_eq!(items[1], item("2", "State Newton's third law."));
    }

    #[test]
    fn test_decimals_and_mid_line_numbers_are_not_markers() {
        let answer = "1. The mass is 2.5 kg, see step 3. above\n10. Compute 4.0 / 2";
        let items = parse_numbered_answer(answer);
        assert_eq!(
            items,
            vec![
                item("1", "The mass is 2.5 kg, see step 3. above"),
                item("10", "Compute 4.0 / 2"),
            ]
        );
    }

    #[test]
    fn test_empty_segment_skipped() {
        let items = parse_numbered_answer("1. \n2. Define work.");
        assert_eq!(items, vec![item("2", "Define work.")]);
    }
}
