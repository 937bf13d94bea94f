use crate::{
    error::ServiceError,
    model::{EncodeOptions, StopCondition, TextTokenizer},
};

pub const SYSTEM_PLACEHOLDER: &str = "<|system_prompt|>";
pub const USER_PLACEHOLDER: &str = "<|user_prompt|>";

/// A stop condition as declared by a template, before it is resolved against
/// a concrete tokenizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSpec {
    /// The tokenizer's end-of-sequence id.
    Eos,
    /// A special token that must map to a single id; dropped when it doesn't.
    SpecialToken(&'static str),
    Text(&'static str),
}

#[derive(Debug)]
pub struct PromptFormat {
    pub id: &'static str,
    pub description: &'static str,
    pub template: &'static str,
    pub default_system_prompt: &'static str,
    pub stops: &'static [StopSpec],
    pub encoding: EncodeOptions,
}

const fn options(add_bos: bool, add_eos: bool, encode_special_tokens: bool) -> EncodeOptions {
    EncodeOptions {
        add_bos,
        add_eos,
        encode_special_tokens,
    }
}

pub static PROMPT_FORMATS: &[PromptFormat] = &[
    PromptFormat {
        id: "plain",
        description: "Model-agnostic chat log",
        template: "<|system_prompt|>\nUser: <|user_prompt|>\nAssistant:",
        default_system_prompt: "This is a conversation between a helpful AI assistant and a user.",
        stops: &[
            StopSpec::Text("User:"),
            StopSpec::Text("U:"),
            StopSpec::Text("USER:"),
            StopSpec::Text("user:"),
            StopSpec::Eos,
        ],
        encoding: options(false, false, false),
    },
    PromptFormat {
        id: "llama",
        description: "Llama 2 chat",
        template: "[INST] <<SYS>>\n<|system_prompt|>\n<</SYS>>\n\n<|user_prompt|> [/INST]",
        default_system_prompt: "You are a helpful, respectful and honest assistant. Always answer as helpfully as possible, while being safe.",
        stops: &[StopSpec::Eos],
        encoding: options(true, false, false),
    },
    PromptFormat {
        id: "llama3",
        description: "Llama 3 instruct",
        template: "<|start_header_id|>system<|end_header_id|>\n\n<|system_prompt|><|eot_id|><|start_header_id|>user<|end_header_id|>\n\n<|user_prompt|><|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n",
        default_system_prompt: "Assist users with tasks and answer questions to the best of your knowledge. Provide helpful and informative responses. If you are unsure or lack knowledge on a topic, admit it and give the best answer you can.",
        stops: &[
            StopSpec::Eos,
            StopSpec::SpecialToken("<|eot_id|>"),
            StopSpec::SpecialToken("<|start_header_id|>"),
        ],
        encoding: options(true, false, true),
    },
    PromptFormat {
        id: "mistral",
        description: "Mistral instruct",
        template: "[INST] <|system_prompt|>\n\n<|user_prompt|> [/INST]",
        default_system_prompt: "You are a helpful AI assistant.",
        stops: &[StopSpec::Eos],
        encoding: options(true, false, false),
    },
    PromptFormat {
        id: "chatml",
        description: "ChatML",
        template: "<|im_start|>system\n<|system_prompt|>\n<|im_end|>\n<|im_start|>user\n<|user_prompt|><|im_end|>\n<|im_start|>assistant\n",
        default_system_prompt: "You are a helpful AI assistant. Answer as concisely as possible.",
        stops: &[StopSpec::Eos, StopSpec::Text("<|im_end|>")],
        encoding: options(false, false, true),
    },
    PromptFormat {
        id: "gemma",
        description: "Gemma instruct",
        template: "<start_of_turn>user\n<|system_prompt|>\n\n<|user_prompt|><end_of_turn>\n<start_of_turn>model\n",
        default_system_prompt: "You are a helpful AI assistant.",
        stops: &[StopSpec::Eos, StopSpec::Text("<end_of_turn>")],
        encoding: options(true, false, true),
    },
    PromptFormat {
        id: "phi3",
        description: "Phi-3 instruct",
        template: "<|system|>\n<|system_prompt|><|end|>\n<|user|>\n<|user_prompt|><|end|>\n<|assistant|>\n",
        default_system_prompt: "You are a helpful AI assistant.",
        stops: &[
            StopSpec::Eos,
            StopSpec::SpecialToken("<|end|>"),
            StopSpec::SpecialToken("<|endoftext|>"),
        ],
        encoding: options(false, false, true),
    },
];

impl PromptFormat {
    pub fn by_id(id: &str) -> Result<&'static PromptFormat, ServiceError> {
        PROMPT_FORMATS
            .iter()
            .find(|format| format.id == id)
            .ok_or_else(|| {
                let known: Vec<_> = PROMPT_FORMATS.iter().map(|f| f.id).collect();
                ServiceError::InvalidConfig(format!(
                    "unknown prompt format '{id}'. Must be one of: {}",
                    known.join(", ")
                ))
            })
    }

    /// Renders a single-turn prompt.
    ///
    /// An absent or empty `system_prompt` falls back to the format's default.
    /// Placeholders are replaced literally, system first, so a system prompt
    /// that itself contains the user placeholder gets the user prompt spliced
    /// in there too. Known limitation; nothing is escaped.
    pub fn render(&self, user_prompt: &str, system_prompt: Option<&str>) -> String {
        let system_prompt = match system_prompt {
            Some(prompt) if !prompt.is_empty() => prompt,
            _ => self.default_system_prompt,
        };
        self.template
            .replace(SYSTEM_PLACEHOLDER, system_prompt)
            .replace(USER_PLACEHOLDER, user_prompt)
    }

    pub fn encode(&self, tokenizer: &dyn TextTokenizer, text: &str) -> Result<Vec<u32>, ServiceError> {
        tokenizer.encode(text, self.encoding)
    }

    /// Resolves the declared stop conditions against `tokenizer`, dropping
    /// those it cannot represent and any duplicates.
    pub fn stop_conditions(&self, tokenizer: &dyn TextTokenizer) -> Vec<StopCondition> {
        let mut resolved = Vec::with_capacity(self.stops.len());
        for spec in self.stops {
            let condition = match *spec {
                StopSpec::Eos => tokenizer.eos_token_id().map(StopCondition::Token),
                StopSpec::SpecialToken(piece) => {
                    tokenizer.single_token_id(piece).map(StopCondition::Token)
                }
                StopSpec::Text(text) if !text.is_empty() => Some(StopCondition::Text(text.into())),
                StopSpec::Text(_) => None,
            };
            if let Some(condition) = condition {
                if !resolved.contains(&condition) {
                    resolved.push(condition);
                }
            }
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct CharTokenizer {
        specials: HashMap<&'static str, u32>,
        eos: Option<u32>,
    }

    impl TextTokenizer for CharTokenizer {
        fn encode(&self, text: &str, options: EncodeOptions) -> Result<Vec<u32>, ServiceError> {
            let mut ids: Vec<u32> = Vec::new();
            if options.add_bos {
                ids.push(1);
            }
            ids.extend(text.chars().map(|c| c as u32));
            if options.add_eos {
                ids.extend(self.eos);
            }
            Ok(ids)
        }

        fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
            Ok(ids.iter().filter_map(|&id| char::from_u32(id)).collect())
        }

        fn single_token_id(&self, piece: &str) -> Option<u32> {
            self.specials.get(piece).copied()
        }

        fn eos_token_id(&self) -> Option<u32> {
            self.eos
        }
    }

    #[test]
    fn ids_are_unique() {
        let mut ids: Vec<_> = PROMPT_FORMATS.iter().map(|f| f.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), PROMPT_FORMATS.len());
    }

    #[test]
    fn every_template_has_both_placeholders() {
        for format in PROMPT_FORMATS {
            assert!(format.template.contains(SYSTEM_PLACEHOLDER), "{}", format.id);
            assert!(format.template.contains(USER_PLACEHOLDER), "{}", format.id);
        }
    }

    #[test]
    fn missing_system_prompt_uses_default() {
        for format in PROMPT_FORMATS {
            let implicit = format.render("hello", None);
            assert_eq!(implicit, format.render("hello", Some(format.default_system_prompt)));
            assert_eq!(implicit, format.render("hello", Some("")));
        }
    }

    #[test]
    fn renders_chatml() {
        let format = PromptFormat::by_id("chatml").unwrap();
        assert_eq!(
            format.render("Hi", Some("Be brief.")),
            "<|im_start|>system\nBe brief.\n<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn placeholder_text_inside_prompts_is_substituted() {
        let format = PromptFormat::by_id("plain").unwrap();
        let rendered = format.render("echo <|system_prompt|>", Some("SYS"));
        assert_eq!(rendered, "SYS\nUser: echo <|system_prompt|>\nAssistant:");

        let rendered = format.render("U", Some("sys <|user_prompt|>"));
        assert_eq!(rendered, "sys U\nUser: U\nAssistant:");
    }

    #[test]
    fn unknown_format_lists_known_ids() {
        let err = PromptFormat::by_id("alpaca").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("alpaca"));
        for format in PROMPT_FORMATS {
            assert!(message.contains(format.id));
        }
    }

    #[test]
    fn stop_conditions_drop_unrepresentable_tokens() {
        let tokenizer = CharTokenizer {
            specials: HashMap::from([("<|eot_id|>", 128009)]),
            eos: Some(128001),
        };
        let format = PromptFormat::by_id("llama3").unwrap();
        assert_eq!(
            format.stop_conditions(&tokenizer),
            vec![StopCondition::Token(128001), StopCondition::Token(128009)]
        );

        let no_eos = CharTokenizer {
            specials: HashMap::new(),
            eos: None,
        };
        let chatml = PromptFormat::by_id("chatml").unwrap();
        assert_eq!(
            chatml.stop_conditions(&no_eos),
            vec![StopCondition::Text("<|im_end|>".into())]
        );
    }

    #[test]
    fn encode_applies_template_options() {
        let tokenizer = CharTokenizer {
            specials: HashMap::new(),
            eos: Some(2),
        };
        let llama = PromptFormat::by_id("llama").unwrap();
        assert_eq!(llama.encode(&tokenizer, "ab").unwrap(), vec![1, 97, 98]);

        let chatml = PromptFormat::by_id("chatml").unwrap();
        assert_eq!(chatml.encode(&tokenizer, "ab").unwrap(), vec![97, 98]);
    }

    #[test]
    fn encoding_rendered_prompt_is_deterministic() {
        let tokenizer = CharTokenizer {
            specials: HashMap::new(),
            eos: Some(2),
        };
        for format in PROMPT_FORMATS {
            let rendered = format.render("hello", Some("system"));
            let first = format.encode(&tokenizer, &rendered).unwrap();
            let second = format.encode(&tokenizer, &rendered).unwrap();
            assert_eq!(first, second);
        }
    }
}
