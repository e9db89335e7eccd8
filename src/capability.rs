use log::warn;
use teloxide::prelude::*;
use teloxide::types::{ChatId, ChatMember, UserId};

/// What the bot and the sender are actually allowed to do in this chat,
/// resolved fresh for every message. Enforcement never exceeds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capability {
    pub bot_can_delete: bool,
    pub bot_can_restrict: bool,
    pub sender_is_admin: bool,
}

impl Capability {
    /// The snapshot used when a membership lookup fails: under-permission is
    /// safe, over-permission is not.
    pub fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberFlags {
    pub is_admin: bool,
    pub can_delete: bool,
    pub can_restrict: bool,
}

pub fn member_flags(member: &ChatMember) -> MemberFlags {
    MemberFlags {
        is_admin: member.is_privileged(),
        can_delete: member.is_administrator() && member.can_delete_messages(),
        can_restrict: member.is_administrator() && member.can_restrict_members(),
    }
}

/// Pure combination step, kept separate from the platform lookups so the
/// mapping is testable. `sender: None` means the message had no individual
/// sender (a linked channel); admin status is then unknown and treated as
/// false, and per-user enforcement is skipped elsewhere.
pub fn combine(bot: MemberFlags, sender: Option<MemberFlags>) -> Capability {
    Capability {
        bot_can_delete: bot.can_delete,
        bot_can_restrict: bot.can_restrict,
        sender_is_admin: sender.map(|s| s.is_admin).unwrap_or(false),
    }
}

pub async fn resolve(
    bot: &Bot,
    chat_id: ChatId,
    bot_id: UserId,
    sender: Option<UserId>,
) -> Capability {
    let bot_flags = match bot.get_chat_member(chat_id, bot_id).await {
        Ok(member) => member_flags(&member),
        Err(e) => {
            warn!("bot membership lookup failed in chat {}: {}", chat_id, e);
            return Capability::none();
        }
    };

    let sender_flags = match sender {
        Some(user_id) => match bot.get_chat_member(chat_id, user_id).await {
            Ok(member) => Some(member_flags(&member)),
            Err(e) => {
                warn!(
                    "sender membership lookup failed for {} in chat {}: {}",
                    user_id, chat_id, e
                );
                return Capability::none();
            }
        },
        None => None,
    };

    combine(bot_flags, sender_flags)
}

/// Admin gate for configuration commands. Lookup failure denies.
pub async fn sender_is_admin(bot: &Bot, chat_id: ChatId, user_id: UserId) -> bool {
    match bot.get_chat_member(chat_id, user_id).await {
        Ok(member) => member.is_privileged(),
        Err(e) => {
            warn!(
                "admin check lookup failed for {} in chat {}: {}",
                user_id, chat_id, e
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_bot() -> MemberFlags {
        MemberFlags {
            is_admin: true,
            can_delete: true,
            can_restrict: true,
        }
    }

    #[test]
    fn bot_rights_carry_over() {
        let caps = combine(full_bot(), Some(MemberFlags::default()));
        assert!(caps.bot_can_delete);
        assert!(caps.bot_can_restrict);
        assert!(!caps.sender_is_admin);
    }

    #[test]
    fn plain_member_bot_has_no_rights() {
        let caps = combine(MemberFlags::default(), Some(MemberFlags::default()));
        assert_eq!(caps, Capability::none());
    }

    #[test]
    fn admin_sender_is_flagged() {
        let sender = MemberFlags {
            is_admin: true,
            ..Default::default()
        };
        let caps = combine(full_bot(), Some(sender));
        assert!(caps.sender_is_admin);
    }

    #[test]
    fn channel_sender_is_never_treated_as_admin() {
        let caps = combine(full_bot(), None);
        assert!(!caps.sender_is_admin);
        assert!(caps.bot_can_delete);
    }
}
