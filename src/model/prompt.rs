//! Prompt construction and response parsing for the reasoning backbone.
//!
//! The backbone asks the LLM for the next reasoning step of a partially
//! solved problem. Each completion is expected to end with a `Step: <text>`
//! line; anything before it is free-form thinking and is discarded.

use crate::model::api::ChatMessage;
use crate::trajectory::types::{Action, State};

const SYSTEM: &str = r#"You are solving a problem one reasoning step at a time.

You will see the problem and the steps taken so far. Propose exactly ONE next
step. Keep it short and concrete: a single calculation, deduction, or the
final answer. If the problem is solved by your step, begin it with "answer:".

You may think briefly first, then finish with a line of the form:
Step: <the next reasoning step>"#;

/// Build the next-step prompt for `state`.
pub fn next_step_prompt(state: &State) -> Vec<ChatMessage> {
    let history = if state.trace.is_empty() {
        "  (no steps yet)".to_string()
    } else {
        state
            .trace
            .iter()
            .enumerate()
            .map(|(i, s)| format!("  {}. {}", i + 1, s))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let user = format!(
        "Problem: {}\n\nSteps so far:\n{}\n\nWhat is step {}?",
        state.problem,
        history,
        state.depth() + 1
    );

    vec![ChatMessage::system(SYSTEM), ChatMessage::user(user)]
}

/// Extract the proposed step from a completion.
///
/// Uses the last `Step:` line (case-insensitive) so that a model mentioning
/// the marker while thinking does not confuse the parser. Falls back to the
/// last non-empty line. Returns `None` for a blank completion.
pub fn parse_step(response: &str) -> Option<Action> {
    let lines: Vec<&str> = response.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let marked = lines.iter().rev().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        lower
            .starts_with("step:")
            .then(|| line["step:".len()..].trim().to_string())
    });

    let text = marked.or_else(|| lines.last().map(|l| l.to_string()))?;
    if text.is_empty() {
        None
    } else {
        Some(Action::new(text))
    }
}

/// Parse completions into distinct candidate steps, keeping first-seen order.
pub fn parse_candidates(responses: &[String], limit: usize) -> Vec<Action> {
    let mut out: Vec<Action> = Vec::new();
    for action in responses.iter().filter_map(|r| parse_step(r)) {
        if out.len() >= limit {
            break;
        }
        if !out.iter().any(|a| a.as_str().eq_ignore_ascii_case(action.as_str())) {
            out.push(action);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_previous_steps() {
        let s = State::new("What is 2 + 3?").advance(&Action::new("take 2"));
        let messages = next_step_prompt(&s);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.contains("Problem: What is 2 + 3?"));
        assert!(messages[1].content.contains("1. take 2"));
        assert!(messages[1].content.contains("What is step 2?"));
    }

    #[test]
    fn prompt_for_fresh_problem() {
        let messages = next_step_prompt(&State::new("p"));
        assert!(messages[1].content.contains("(no steps yet)"));
    }

    #[test]
    fn parse_uses_last_step_line() {
        let response = "I could write Step: wrong here.\nThinking...\nStep: add 2 and 3";
        assert_eq!(parse_step(response).unwrap().as_str(), "add 2 and 3");
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(parse_step("STEP: answer: 5").unwrap().as_str(), "answer: 5");
    }

    #[test]
    fn parse_falls_back_to_last_line() {
        assert_eq!(parse_step("hmm\n  answer: 5  \n").unwrap().as_str(), "answer: 5");
        assert!(parse_step("   \n").is_none());
        assert!(parse_step("Step:   ").is_none());
    }

    #[test]
    fn candidates_are_deduplicated_and_limited() {
        let responses = vec![
            "Step: a".to_string(),
            "Step: A".to_string(),
            "Step: b".to_string(),
            "".to_string(),
            "Step: c".to_string(),
        ];
        let c = parse_candidates(&responses, 2);
        assert_eq!(c, vec![Action::new("a"), Action::new("b")]);
    }
}
