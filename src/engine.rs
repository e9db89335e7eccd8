use anyhow::Result;
use log::{debug, error, info};
use teloxide::prelude::*;
use teloxide::types::{ChatId, ChatPermissions, Message, MessageId, ParseMode, UserId};

use crate::appeal;
use crate::capability::{self, Capability};
use crate::classify::Verdict;
use crate::history::{now_ts, ViolationRecord};
use crate::policy::{ChatPolicy, Punishment};
use crate::text::{escape_markdown, shorten};
use crate::AppState;

/// Who produced the offending message. Telegram lets linked channels post
/// into the discussion group with no individual sender; the only enforcement
/// primitive against those is a sender-chat ban.
#[derive(Debug, Clone, PartialEq)]
pub enum Offender {
    User { id: UserId, name: String },
    Channel { id: ChatId, title: String },
}

impl Offender {
    pub fn from_message(msg: &Message) -> Option<Self> {
        if let Some(chat) = &msg.sender_chat {
            return Some(Offender::Channel {
                id: chat.id,
                title: chat.title().unwrap_or("unknown channel").to_string(),
            });
        }
        let user = msg.from.as_ref()?;
        let name = match &user.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", user.first_name, last),
            _ => user.first_name.clone(),
        };
        Some(Offender::User {
            id: user.id,
            name,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Offender::User { name, .. } => name,
            Offender::Channel { title, .. } => title,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Offender::User { id, .. } => Some(*id),
            Offender::Channel { .. } => None,
        }
    }
}

/// One platform call the executor will issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    DeleteMessage,
    BanUser,
    KickUser,
    MuteUser,
    BanSenderChannel,
}

/// The computed response to a spam verdict: platform calls to issue, the
/// human-readable action list for the chat notice, and the punishment to
/// record in the violation history, if any.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub actions: Vec<String>,
    pub record: Option<Punishment>,
}

/// Decide what to do about a verdict. The applied punishment is the policy
/// punishment intersected with the capability snapshot. Deletion runs first
/// so the notice posted afterwards never sits next to the spam itself.
pub fn decide(
    verdict: &Verdict,
    caps: &Capability,
    policy: &ChatPolicy,
    offender: &Offender,
    record_all: bool,
) -> Plan {
    let mut plan = Plan::default();
    if !verdict.is_spam {
        return plan;
    }

    if caps.bot_can_delete {
        plan.steps.push(Step::DeleteMessage);
        plan.actions.push("deleted the message".to_string());
    }

    if caps.sender_is_admin {
        plan.actions.push("no action taken (admin)".to_string());
        return plan;
    }

    if !caps.bot_can_restrict {
        plan.actions.push("insufficient permissions".to_string());
        return plan;
    }

    match offender {
        Offender::Channel { .. } => {
            if policy.punishment != Punishment::Delete {
                plan.steps.push(Step::BanSenderChannel);
                plan.actions.push("banned the channel".to_string());
            }
        }
        Offender::User { .. } => {
            match policy.punishment {
                Punishment::Ban => {
                    plan.steps.push(Step::BanUser);
                    plan.actions.push("banned the user".to_string());
                }
                Punishment::Kick => {
                    plan.steps.push(Step::KickUser);
                    plan.actions.push("kicked the user".to_string());
                }
                Punishment::Mute => {
                    plan.steps.push(Step::MuteUser);
                    plan.actions.push("muted the user".to_string());
                }
                Punishment::Delete => {}
            }
            if policy.punishment.is_recorded() || record_all {
                plan.record = Some(policy.punishment);
            }
        }
    }

    plan
}

/// Issue the planned platform calls. Each call catches and logs its own
/// failure; a failed deletion or ban never aborts the rest of the plan and
/// nothing is rolled back.
pub async fn apply(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    offender: &Offender,
    plan: &Plan,
) {
    for step in &plan.steps {
        match step {
            Step::DeleteMessage => {
                if let Err(e) = bot.delete_message(chat_id, message_id).await {
                    error!("failed to delete message {} in {}: {}", message_id.0, chat_id, e);
                }
            }
            Step::BanUser => {
                let Some(user_id) = offender.user_id() else {
                    continue;
                };
                match bot.ban_chat_member(chat_id, user_id).await {
                    Ok(_) => info!("banned user {} in chat {}", user_id, chat_id),
                    Err(e) => error!("failed to ban user {} in {}: {}", user_id, chat_id, e),
                }
            }
            Step::KickUser => {
                let Some(user_id) = offender.user_id() else {
                    continue;
                };
                if let Err(e) = bot.ban_chat_member(chat_id, user_id).await {
                    error!("failed to kick user {} in {}: {}", user_id, chat_id, e);
                }
                // Immediate unban turns the ban into an expulsion without a
                // persistent block.
                if let Err(e) = bot.unban_chat_member(chat_id, user_id).await {
                    error!("failed to unban kicked user {} in {}: {}", user_id, chat_id, e);
                }
            }
            Step::MuteUser => {
                let Some(user_id) = offender.user_id() else {
                    continue;
                };
                match bot
                    .restrict_chat_member(chat_id, user_id, ChatPermissions::empty())
                    .await
                {
                    Ok(_) => info!("muted user {} in chat {}", user_id, chat_id),
                    Err(e) => error!("failed to mute user {} in {}: {}", user_id, chat_id, e),
                }
            }
            Step::BanSenderChannel => {
                let Offender::Channel { id, .. } = offender else {
                    continue;
                };
                match bot.ban_chat_sender_chat(chat_id, *id).await {
                    Ok(_) => info!("banned sender channel {} in chat {}", id, chat_id),
                    Err(e) => error!("failed to ban sender channel {} in {}: {}", id, chat_id, e),
                }
            }
        }
    }
}

/// The notice posted back into the chat: offender, a truncated quote of the
/// offending text, the actions taken, and the localized reason.
pub fn compose_chat_notice(
    offender_name: &str,
    offending_text: &str,
    actions: &[String],
    reason: &str,
) -> String {
    let actions_line = if actions.is_empty() {
        "no action taken".to_string()
    } else {
        actions.join(", ")
    };
    format!(
        "🚫 Spam detected from *{}*\n_{}_\n\nActions: {}\nReason: {}",
        escape_markdown(offender_name),
        escape_markdown(&shorten(offending_text, 100)),
        escape_markdown(&actions_line),
        escape_markdown(reason)
    )
}

/// The private notice sent to a punished user, paired with an appeal button.
pub fn compose_user_notice(chat_title: &str, punishment: Punishment, reason: &str) -> String {
    format!(
        "Your message in *{}* was flagged as spam and the *{}* punishment was applied\\.\n\
Reason: {}\n\n\
If you believe this was a mistake, you can appeal to the chat administrators below\\.",
        escape_markdown(chat_title),
        escape_markdown(punishment.as_str()),
        escape_markdown(reason)
    )
}

/// Per-message moderation pipeline: policy → classify (fail-open) →
/// capability → decide → apply → record → notify. Stateless across messages.
pub async fn moderate_message(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if msg.from.as_ref().is_some_and(|u| u.is_bot) {
        return Ok(());
    }
    // Anonymous admins post as the group itself; they are exempt.
    if msg.sender_chat.as_ref().is_some_and(|c| c.id == msg.chat.id) {
        debug!("skipping anonymous admin message in {}", msg.chat.id);
        return Ok(());
    }

    let chat_id = msg.chat.id;
    let policy = state.store.chat_policy(chat_id.0).await;
    let verdict = state
        .classifier
        .classify_or_clean(&policy.rules, &policy.language, text)
        .await;
    if !verdict.is_spam {
        return Ok(());
    }

    let Some(offender) = Offender::from_message(msg) else {
        debug!("spam verdict in {} but no identifiable sender", chat_id);
        return Ok(());
    };

    let caps = capability::resolve(bot, chat_id, state.bot_id, offender.user_id()).await;
    let plan = decide(&verdict, &caps, &policy, &offender, state.record_all_punishments);
    info!(
        "spam in chat {}: offender={} punishment={} actions={:?}",
        chat_id,
        offender.name(),
        policy.punishment,
        plan.actions
    );

    apply(bot, chat_id, msg.id, &offender, &plan).await;

    let mut recorded: Option<(UserId, ViolationRecord)> = None;
    if let (Some(punishment), Some(user_id)) = (plan.record, offender.user_id()) {
        let record = ViolationRecord {
            chat_id: chat_id.0,
            chat_title: msg.chat.title().unwrap_or("unknown group").to_string(),
            timestamp: now_ts(),
            punishment,
            content: text.to_string(),
            reason: verdict.reason.clone(),
            handled: false,
        };
        match state.store.append_violation(user_id.0, record.clone()).await {
            Ok(()) => recorded = Some((user_id, record)),
            Err(e) => error!("failed to record violation for {}: {:#}", user_id, e),
        }
    }

    let notice = compose_chat_notice(offender.name(), text, &plan.actions, &verdict.reason);
    if let Err(e) = bot
        .send_message(chat_id, notice)
        .parse_mode(ParseMode::MarkdownV2)
        .await
    {
        error!("failed to post moderation notice in {}: {}", chat_id, e);
    }

    if let Some((user_id, record)) = recorded {
        let dm = compose_user_notice(&record.chat_title, record.punishment, &record.reason);
        let sent = bot
            .send_message(ChatId(user_id.0 as i64), dm)
            .parse_mode(ParseMode::MarkdownV2)
            .reply_markup(appeal::appeal_keyboard(record.chat_id))
            .await;
        if let Err(e) = sent {
            // Users who never opened a private chat with the bot are not
            // reachable; the chat notice already covers them.
            debug!("could not notify user {} privately: {}", user_id, e);
        }
    }

    Ok(())
}
