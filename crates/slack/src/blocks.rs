use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    PlainText { text: String },
    Mrkdwn { text: String },
}

impl TextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::PlainText { text: text.into() }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self::Mrkdwn { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::PlainText { text } | Self::Mrkdwn { text } => text,
        }
    }

    fn prefix(&mut self, prefix: &str) {
        match self {
            Self::PlainText { text } | Self::Mrkdwn { text } => text.insert_str(0, prefix),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { block_id: String, text: TextObject },
    Context { block_id: String, elements: Vec<TextObject> },
    Divider { block_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MessageTemplate {
    pub fallback_text: String,
    pub blocks: Vec<Block>,
}

impl MessageTemplate {
    /// Addresses the message to a user, as done for private replies.
    pub fn addressed_to(mut self, platform_user_id: &str) -> Self {
        let prefix = format!("<@{platform_user_id}>, ");
        if self.fallback_text.starts_with(&prefix) {
            return self;
        }
        self.fallback_text.insert_str(0, &prefix);
        if let Some(Block::Section { text, .. }) =
            self.blocks.iter_mut().find(|block| matches!(block, Block::Section { .. }))
        {
            text.prefix(&prefix);
        }
        self
    }

    /// All section text, for logs and tests.
    pub fn section_text(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                Block::Section { text, .. } => Some(text.text()),
                _ => None,
            })
            .collect()
    }
}

pub struct MessageBuilder {
    fallback_text: String,
    blocks: Vec<Block>,
}

impl MessageBuilder {
    pub fn new(fallback_text: impl Into<String>) -> Self {
        Self { fallback_text: fallback_text.into(), blocks: Vec::new() }
    }

    pub fn section<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut SectionBuilder),
    {
        let mut builder = SectionBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Section { block_id: block_id.into(), text: builder.build() });
        self
    }

    pub fn context<F>(mut self, block_id: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&mut ContextBuilder),
    {
        let mut builder = ContextBuilder::default();
        build(&mut builder);
        self.blocks.push(Block::Context { block_id: block_id.into(), elements: builder.build() });
        self
    }

    pub fn divider(mut self, block_id: impl Into<String>) -> Self {
        self.blocks.push(Block::Divider { block_id: block_id.into() });
        self
    }

    pub fn build(self) -> MessageTemplate {
        MessageTemplate { fallback_text: self.fallback_text, blocks: self.blocks }
    }
}

#[derive(Default)]
pub struct SectionBuilder {
    text: Option<TextObject>,
}

impl SectionBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.text = Some(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> TextObject {
        self.text.unwrap_or_else(|| TextObject::plain(""))
    }
}

#[derive(Default)]
pub struct ContextBuilder {
    elements: Vec<TextObject>,
}

impl ContextBuilder {
    pub fn plain(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::plain(text));
        self
    }

    pub fn mrkdwn(&mut self, text: impl Into<String>) -> &mut Self {
        self.elements.push(TextObject::mrkdwn(text));
        self
    }

    fn build(self) -> Vec<TextObject> {
        self.elements
    }
}

/// Single-section message whose fallback is the same text.
pub fn notice(block_id: &str, text: impl Into<String>) -> MessageTemplate {
    let text = text.into();
    MessageBuilder::new(text.clone())
        .section(block_id, |section| {
            section.mrkdwn(text);
        })
        .build()
}

/// Message shown before the user's language is known: Spanish first, then
/// English in italics.
pub fn bilingual_notice(block_id: &str, es: &str, en: &str) -> MessageTemplate {
    notice(block_id, format!("{es}\n_{en}_"))
}

pub fn error_message(summary: &str, correlation_id: &str) -> MessageTemplate {
    MessageBuilder::new(summary.to_owned())
        .section("dona.error.summary.v1", |section| {
            section.mrkdwn(format!(":warning: {summary}"));
        })
        .context("dona.error.context.v1", |context| {
            context.plain(format!("Ref: {correlation_id}"));
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::{bilingual_notice, error_message, notice, Block, MessageBuilder, TextObject};

    #[test]
    fn message_builder_creates_typed_block_structure() {
        let message = MessageBuilder::new("fallback")
            .section("dona.task.summary.v1", |section| {
                section.mrkdwn("*Tareas*");
            })
            .divider("dona.task.divider.v1")
            .context("dona.task.context.v1", |context| {
                context.plain("3 abiertas");
            })
            .build();

        assert_eq!(message.blocks.len(), 3);
        assert!(matches!(
            &message.blocks[0],
            Block::Section { block_id, text: TextObject::Mrkdwn { .. } }
                if block_id == "dona.task.summary.v1"
        ));
        assert!(matches!(&message.blocks[2], Block::Context { elements, .. } if elements.len() == 1));
    }

    #[test]
    fn blocks_serialize_with_slack_type_tags() {
        let message = notice("dona.test.v1", "hola");
        let json = serde_json::to_value(&message.blocks).expect("serialize");

        assert_eq!(json[0]["type"], "section");
        assert_eq!(json[0]["text"]["type"], "mrkdwn");
        assert_eq!(json[0]["text"]["text"], "hola");
    }

    #[test]
    fn addressing_prefixes_fallback_and_first_section_once() {
        let message = notice("dona.test.v1", "listo").addressed_to("U1").addressed_to("U1");

        assert_eq!(message.fallback_text, "<@U1>, listo");
        assert_eq!(message.section_text(), vec!["<@U1>, listo"]);
    }

    #[test]
    fn error_message_carries_correlation_reference() {
        let message = error_message("Algo salió mal", "req-9");

        assert_eq!(message.fallback_text, "Algo salió mal");
        assert!(matches!(
            &message.blocks[1],
            Block::Context { elements, .. } if elements[0].text() == "Ref: req-9"
        ));
    }

    #[test]
    fn bilingual_notice_puts_spanish_first() {
        let message = bilingual_notice("dona.test.v1", "Hola", "Hello");
        assert_eq!(message.fallback_text, "Hola\n_Hello_");
    }
}
