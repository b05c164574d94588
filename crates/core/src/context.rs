//! Public/private classification of an interaction.

use crate::domain::conversation::ContextType;

/// Channel metadata as delivered with an event. Slash commands carry a
/// channel name, message events carry a channel type; either may be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelOrigin {
    pub channel_id: String,
    pub channel_type: Option<String>,
    pub channel_name: Option<String>,
}

impl ChannelOrigin {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self { channel_id: channel_id.into(), channel_type: None, channel_name: None }
    }

    pub fn with_type(mut self, channel_type: impl Into<String>) -> Self {
        self.channel_type = Some(channel_type.into());
        self
    }

    pub fn with_name(mut self, channel_name: impl Into<String>) -> Self {
        self.channel_name = Some(channel_name.into());
        self
    }
}

/// Only one-to-one direct messages are private. Group DMs (`mpim`) are shared
/// with several people and count as public.
pub fn classify(origin: &ChannelOrigin) -> ContextType {
    if let Some(channel_type) = origin.channel_type.as_deref() {
        return if channel_type == "im" { ContextType::Private } else { ContextType::Public };
    }
    if let Some(channel_name) = origin.channel_name.as_deref() {
        return if channel_name == "directmessage" {
            ContextType::Private
        } else {
            ContextType::Public
        };
    }
    if origin.channel_id.starts_with('D') {
        ContextType::Private
    } else {
        ContextType::Public
    }
}

const PRIVATE_ONLY: &[&str] = &["/dona-config", "/dona-metrics"];

pub fn allowed_in(context: ContextType, command: &str) -> bool {
    context.is_private() || !PRIVATE_ONLY.contains(&command)
}

pub fn is_private_only(command: &str) -> bool {
    PRIVATE_ONLY.contains(&command)
}

#[cfg(test)]
mod tests {
    use super::{allowed_in, classify, ChannelOrigin};
    use crate::domain::conversation::ContextType;

    #[test]
    fn direct_messages_are_private() {
        assert_eq!(classify(&ChannelOrigin::new("D123").with_type("im")), ContextType::Private);
        assert_eq!(
            classify(&ChannelOrigin::new("D123").with_name("directmessage")),
            ContextType::Private
        );
        assert_eq!(classify(&ChannelOrigin::new("D123")), ContextType::Private);
    }

    #[test]
    fn channels_and_group_dms_are_public() {
        assert_eq!(classify(&ChannelOrigin::new("C1").with_type("channel")), ContextType::Public);
        assert_eq!(classify(&ChannelOrigin::new("G1").with_type("mpim")), ContextType::Public);
        assert_eq!(classify(&ChannelOrigin::new("C1").with_name("general")), ContextType::Public);
        assert_eq!(classify(&ChannelOrigin::new("C1")), ContextType::Public);
    }

    #[test]
    fn explicit_channel_type_wins_over_id_prefix() {
        assert_eq!(classify(&ChannelOrigin::new("D9").with_type("channel")), ContextType::Public);
    }

    #[test]
    fn privileged_commands_need_private_context() {
        assert!(!allowed_in(ContextType::Public, "/dona-metrics"));
        assert!(!allowed_in(ContextType::Public, "/dona-config"));
        assert!(allowed_in(ContextType::Private, "/dona-metrics"));
        assert!(allowed_in(ContextType::Public, "/dona-task"));
    }
}
