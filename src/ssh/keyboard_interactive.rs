//! Keyboard-interactive authentication support
//!
//! Server prompts are answered in one of three ways, per prompt: the
//! configured password when the prompt text looks like a password request,
//! a forwarded interactive prompt to the browser when a dispatcher is
//! available, or an empty string. `forward_all` disables the auto-answer
//! shortcut entirely.

use tracing::debug;

use crate::prompt::{PromptButton, PromptDispatcher, PromptInput, PromptPayload};

/// How long the browser gets to answer forwarded auth prompts.
const KBI_PROMPT_TIMEOUT_MS: u64 = 120_000;

/// One prompt as received from the SSH server.
#[derive(Debug, Clone)]
pub struct InteractivePrompt {
    pub prompt: String,
    /// False means the client should mask the input.
    pub echo: bool,
}

pub struct KeyboardInteractivePrompter {
    password: Option<String>,
    forward_all: bool,
    dispatcher: Option<PromptDispatcher>,
}

impl KeyboardInteractivePrompter {
    pub fn new(
        password: Option<String>,
        forward_all: bool,
        dispatcher: Option<PromptDispatcher>,
    ) -> Self {
        Self {
            password,
            forward_all,
            dispatcher,
        }
    }

    fn auto_answer(&self, prompt: &InteractivePrompt) -> Option<String> {
        if self.forward_all {
            return None;
        }
        let password = self.password.as_ref()?;
        if prompt.prompt.to_lowercase().contains("password") {
            Some(password.clone())
        } else {
            None
        }
    }

    /// Produce an answer for every prompt, in order.
    pub async fn answer(
        &self,
        name: &str,
        instructions: &str,
        prompts: &[InteractivePrompt],
    ) -> Vec<String> {
        let mut answers: Vec<Option<String>> =
            prompts.iter().map(|p| self.auto_answer(p)).collect();

        let unanswered: Vec<usize> = answers
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_none())
            .map(|(i, _)| i)
            .collect();

        if !unanswered.is_empty() {
            if let Some(dispatcher) = &self.dispatcher {
                let payload = build_payload(name, instructions, prompts, &unanswered);
                match dispatcher.ask(payload).await {
                    Ok(response) if response.action == "submit" => {
                        for index in &unanswered {
                            if let Some(value) = response.inputs.get(&input_key(*index)) {
                                answers[*index] = Some(value.clone());
                            }
                        }
                    }
                    Ok(response) => {
                        debug!(action = %response.action, "interactive auth prompt not submitted");
                    }
                    Err(err) => {
                        debug!(error = %err, "interactive auth prompt failed");
                    }
                }
            }
        }

        answers
            .into_iter()
            .map(|a| a.unwrap_or_default())
            .collect()
    }
}

fn input_key(index: usize) -> String {
    format!("prompt_{index}")
}

fn truncate(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

fn build_payload(
    name: &str,
    instructions: &str,
    prompts: &[InteractivePrompt],
    unanswered: &[usize],
) -> PromptPayload {
    let title = if name.trim().is_empty() {
        "Interactive authentication".to_string()
    } else {
        truncate(name, 120)
    };
    let message = if instructions.trim().is_empty() {
        None
    } else {
        Some(truncate(instructions, 1000))
    };

    PromptPayload {
        id: String::new(),
        title,
        message,
        icon: Some("key".to_string()),
        buttons: vec![PromptButton {
            action: "submit".into(),
            label: "Submit".into(),
        }],
        inputs: unanswered
            .iter()
            .map(|&i| PromptInput {
                key: input_key(i),
                label: truncate(&prompts[i].prompt, 120),
                required: false,
                secret: !prompts[i].echo,
            })
            .collect(),
        timeout: KBI_PROMPT_TIMEOUT_MS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(text: &str) -> InteractivePrompt {
        InteractivePrompt {
            prompt: text.to_string(),
            echo: false,
        }
    }

    #[tokio::test]
    async fn password_prompt_is_auto_answered() {
        let prompter =
            KeyboardInteractivePrompter::new(Some("s3cret".into()), false, None);
        let answers = prompter
            .answer("", "", &[prompt("Password: ")])
            .await;
        assert_eq!(answers, vec!["s3cret".to_string()]);
    }

    #[tokio::test]
    async fn auto_answer_is_case_insensitive() {
        let prompter =
            KeyboardInteractivePrompter::new(Some("s3cret".into()), false, None);
        let answers = prompter
            .answer("", "", &[prompt("PASSWORD for alice:")])
            .await;
        assert_eq!(answers, vec!["s3cret".to_string()]);
    }

    #[tokio::test]
    async fn non_password_prompt_without_dispatcher_answers_empty() {
        let prompter =
            KeyboardInteractivePrompter::new(Some("s3cret".into()), false, None);
        let answers = prompter
            .answer("", "", &[prompt("Verification code: ")])
            .await;
        assert_eq!(answers, vec![String::new()]);
    }

    #[tokio::test]
    async fn forward_all_disables_auto_answer() {
        let prompter = KeyboardInteractivePrompter::new(Some("s3cret".into()), true, None);
        let answers = prompter.answer("", "", &[prompt("Password: ")]).await;
        assert_eq!(answers, vec![String::new()]);
    }

    #[test]
    fn payload_masks_no_echo_prompts() {
        let prompts = vec![
            InteractivePrompt {
                prompt: "Code".into(),
                echo: true,
            },
            InteractivePrompt {
                prompt: "Secret".into(),
                echo: false,
            },
        ];
        let payload = build_payload("OTP", "Enter values", &prompts, &[0, 1]);
        assert_eq!(payload.inputs.len(), 2);
        assert!(!payload.inputs[0].secret);
        assert!(payload.inputs[1].secret);
        assert!(payload.validate().is_ok());
    }
}
