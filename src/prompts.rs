//! Prompt templates for questionnaire items.
//!
//! Provider-agnostic. The coercion layer decides whether the JSON instruction
//! is appended or a forced tool call carries the schema instead.

use serde_json::json;

use crate::gateway::{Message, ToolSpec};

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

pub const RUBRIC_SYSTEM: &str = r#"You must respond with a score from 1-5 where:
1 = Strongly Disagree
2 = Disagree
3 = Neutral
4 = Agree
5 = Strongly Agree

Provide only the numerical score that best matches your response."#;

/// Appended for providers that rely on prompt instruction rather than tool calls.
pub const JSON_INSTRUCTION: &str = r#"Reply with only a JSON object of the form {"score": <integer 1-5>} and nothing else."#;

pub const SCORE_TOOL_NAME: &str = "record_score";

/// Render the rubric prompt for one item. `question` must already be stripped
/// of its annotation.
pub fn render(question: &str, json_instruction: bool) -> PromptInstance {
    let system = if json_instruction {
        format!("{RUBRIC_SYSTEM}\n\n{JSON_INSTRUCTION}")
    } else {
        RUBRIC_SYSTEM.to_string()
    };
    PromptInstance {
        system,
        user: question.trim().to_string(),
    }
}

/// The forced tool whose arguments are the score schema.
pub fn score_tool() -> ToolSpec {
    ToolSpec {
        name: SCORE_TOOL_NAME,
        description: "A response to a personality assessment question with a score from 1-5",
        parameters: json!({
            "type": "object",
            "properties": {
                "score": {
                    "type": "integer",
                    "description": "Rating from 1-5 where 1=strongly disagree and 5=strongly agree",
                    "minimum": 1,
                    "maximum": 5
                }
            },
            "required": ["score"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Role;

    #[test]
    fn render_plain_rubric() {
        let p = render("I am talkative", false);
        assert!(p.system.contains("Strongly Disagree"));
        assert!(!p.system.contains("JSON"));
        assert_eq!(p.user, "I am talkative");

        let msgs = p.to_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);
    }

    #[test]
    fn render_with_json_instruction() {
        let p = render("  I worry a lot ", true);
        assert!(p.system.ends_with(JSON_INSTRUCTION));
        assert_eq!(p.user, "I worry a lot");
    }

    #[test]
    fn tool_schema_bounds_score() {
        let tool = score_tool();
        assert_eq!(tool.name, "record_score");
        assert_eq!(tool.parameters["properties"]["score"]["minimum"], 1);
        assert_eq!(tool.parameters["properties"]["score"]["maximum"], 5);
        assert_eq!(tool.parameters["required"][0], "score");
    }
}
