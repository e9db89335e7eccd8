use anyhow::Result;
use log::{debug, info, warn};
use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, User};

use crate::history::ViolationRecord;
use crate::text::{format_ts, shorten};
use crate::AppState;

pub const CALLBACK_PREFIX: &str = "appeal:";

pub fn appeal_keyboard(chat_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
        "📨 Appeal to the admins",
        format!("{}{}", CALLBACK_PREFIX, chat_id),
    )]])
}

/// The dispute summary each administrator receives. Plain text: admin DMs
/// carry user-authored content and should never fail on formatting.
pub fn compose_dispute(
    user_name: &str,
    user_id: u64,
    chat_id: i64,
    record: Option<&ViolationRecord>,
) -> String {
    let mut out = format!(
        "⚖️ Moderation appeal\nFrom: {} (id {})\n",
        user_name, user_id
    );
    match record {
        Some(rec) => {
            out.push_str(&format!(
                "Chat: {} ({})\nPunishment: {}\nWhen: {}\nFlagged message:\n{}\nReason: {}\n",
                rec.chat_title,
                rec.chat_id,
                rec.punishment,
                format_ts(rec.timestamp),
                shorten(&rec.content, 200),
                rec.reason
            ));
        }
        None => {
            out.push_str(&format!(
                "Chat: {}\nNo stored violation details were found for this chat.\n",
                chat_id
            ));
        }
    }
    out.push_str("\nThe user believes this decision was a mistake.");
    out
}

/// What the requesting user is told once the fan-out finishes.
pub fn outcome_message(reached: usize, total: usize) -> String {
    if reached == 0 {
        "I couldn't reach any administrator in a direct message. Please raise the issue in the \
group chat itself, where the administrators will see it."
            .to_string()
    } else {
        format!(
            "Notified {} of {} administrators about your appeal. They will review your case.",
            reached, total
        )
    }
}

/// Best-effort fan-out to the chat's administrators. Each human admin gets
/// one DM, delivery outcomes split them into reached/unreachable, and the
/// requester is told the result. No retries; the violation record stays
/// untouched.
pub async fn handle_appeal(bot: &Bot, state: &AppState, user: &User, chat_id: i64) -> Result<()> {
    let reply_to = ChatId(user.id.0 as i64);

    let admins = match bot.get_chat_administrators(ChatId(chat_id)).await {
        Ok(admins) => admins,
        Err(e) => {
            warn!("administrator lookup failed for chat {}: {}", chat_id, e);
            bot.send_message(
                reply_to,
                "I couldn't look up the chat's administrators right now. Please try again later.",
            )
            .await?;
            return Ok(());
        }
    };

    let record = state
        .store
        .violations(user.id.0)
        .await
        .into_iter()
        .filter(|r| r.chat_id == chat_id)
        .last();
    let dispute = compose_dispute(&user.full_name(), user.id.0, chat_id, record.as_ref());

    let mut reached = 0usize;
    let mut total = 0usize;
    for admin in admins.iter().filter(|m| !m.user.is_bot) {
        total += 1;
        match bot
            .send_message(ChatId(admin.user.id.0 as i64), dispute.clone())
            .await
        {
            Ok(_) => reached += 1,
            Err(e) => debug!("administrator {} unreachable: {}", admin.user.id, e),
        }
    }
    info!(
        "appeal from user {} for chat {}: reached {}/{} admins",
        user.id, chat_id, reached, total
    );

    bot.send_message(reply_to, outcome_message(reached, total))
        .await?;
    Ok(())
}
