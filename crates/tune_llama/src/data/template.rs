//! Instruction/response prompt layout shared by training, generation and the
//! serving manifest.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    user_start: String,
    separator: String,
    assistant_start: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::instruction()
    }
}

impl PromptTemplate {
    /// `### Instruction:` / `### Response:` layout.
    pub fn instruction() -> Self {
        Self {
            user_start: "### Instruction:\n".to_string(),
            separator: "\n\n".to_string(),
            assistant_start: "### Response:".to_string(),
        }
    }

    /// Full training text: prompt, newline, response.
    pub fn render(&self, input: &str, output: &str) -> String {
        let mut text = self.prompt(input);
        text.push('\n');
        text.push_str(output);
        text
    }

    /// Everything up to and including the response header, without a trailing newline.
    pub fn prompt(&self, input: &str) -> String {
        let mut text = String::with_capacity(
            self.user_start.len() + input.len() + self.separator.len() + self.assistant_start.len(),
        );
        text.push_str(&self.user_start);
        text.push_str(input);
        text.push_str(&self.separator);
        text.push_str(&self.assistant_start);
        text
    }

    /// Header lines a model should stop at when it starts a new turn.
    pub fn stop_sequences(&self) -> Vec<String> {
        vec![
            self.user_start.trim_end().to_string(),
            self.assistant_start.trim_end().to_string(),
        ]
    }

    /// Text generated after the response header, or the whole text if absent.
    pub fn extract_response<'a>(&self, generated: &'a str) -> &'a str {
        match generated.rfind(self.assistant_start.as_str()) {
            Some(idx) => generated[idx + self.assistant_start.len()..].trim(),
            None => generated.trim(),
        }
    }

    pub fn user_header(&self) -> &str {
        self.user_start.trim_end()
    }

    pub fn response_header(&self) -> &str {
        self.assistant_start.trim_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_layout() {
        let t = PromptTemplate::instruction();
        assert_eq!(
            t.render("list files", "ls -la"),
            "### Instruction:\nlist files\n\n### Response:\nls -la"
        );
        assert_eq!(t.prompt("x"), "### Instruction:\nx\n\n### Response:");
        assert_eq!(t.stop_sequences(), vec!["### Instruction:", "### Response:"]);
    }

    #[test]
    fn test_extract_response() {
        let t = PromptTemplate::instruction();
        let text = t.render("find big files", "du -sh * | sort -rh");
        assert_eq!(t.extract_response(&text), "du -sh * | sort -rh");
        assert_eq!(t.extract_response("  no header "), "no header");
    }
}
