use anyhow::{Context, Result};
use dotenvy::dotenv;
use log::{error, info};
use std::env;
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, Message, UserId,
};

mod appeal;
mod capability;
mod classify;
mod engine;
mod history;
mod policy;
mod store;
mod text;

use classify::Classifier;
use history::ViolationRecord;
use policy::Punishment;
use store::Store;
use text::{format_ts, shorten};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "openai/gpt-4.1-mini";
const DEFAULT_DB_PATH: &str = "bot.sqlite";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub classifier: Classifier,
    pub bot_id: UserId,
    pub record_all_punishments: bool,
}

fn help_text() -> &'static str {
    "🛡 Spam Warden Help\n\n\
Group messages are checked against the chat's spam rules; confirmed spam is \
removed and punished according to the chat's configured punishment.\n\n\
Group commands (admins only):\n\
• /setrules <text>: what counts as spam in this chat\n\
• /setlanguage <language>: language used for moderation reasons\n\
• /setpunishment <delete|mute|kick|ban>: punishment applied to spammers\n\
• /resetpolicy: reset rules, language, and punishment to the defaults\n\
• /test <message>: classify a message and show the verdict\n\n\
Private commands:\n\
• /start: overview and your recent violations\n\
• /help: this message\n\n\
Punished users get a private notice with an appeal button that contacts the \
chat's administrators.\n"
}

fn greeting_text() -> &'static str {
    "👋 Welcome to Spam Warden. I watch group chats for spam and apply the \
punishment configured by the chat's administrators. Use /help to see the \
available commands."
}

// Split "/cmd@BotName args" into the bare command and its argument tail.
fn command_parts(text: &str) -> (&str, &str) {
    let (cmd, rest) = match text.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (text, ""),
    };
    (cmd.split('@').next().unwrap_or(cmd), rest)
}

fn start_text(window: &[ViolationRecord]) -> String {
    let mut out = greeting_text().to_string();
    if window.is_empty() {
        return out;
    }
    out.push_str("\n\nYour recent violations:\n");
    for rec in window {
        out.push_str(&format!(
            "• {} [{}] {} ({})\n  {}\n",
            rec.chat_title,
            rec.punishment,
            format_ts(rec.timestamp),
            if rec.handled { "resolved" } else { "open" },
            shorten(&rec.reason, 120)
        ));
    }
    out
}

fn appeal_buttons(window: &[ViolationRecord]) -> Vec<Vec<InlineKeyboardButton>> {
    let mut seen: Vec<i64> = Vec::new();
    let mut rows = Vec::new();
    for rec in window {
        if seen.contains(&rec.chat_id) {
            continue;
        }
        seen.push(rec.chat_id);
        rows.push(vec![InlineKeyboardButton::callback(
            format!("📨 Appeal: {}", shorten(&rec.chat_title, 40)),
            format!("{}{}", appeal::CALLBACK_PREFIX, rec.chat_id),
        )]);
    }
    rows
}

async fn require_admin(bot: &Bot, msg: &Message) -> Result<bool> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(false);
    };
    if capability::sender_is_admin(bot, msg.chat.id, user.id).await {
        return Ok(true);
    }
    bot.send_message(msg.chat.id, "Only chat administrators can use this command.")
        .await?;
    Ok(false)
}

async fn handle_group_command(bot: &Bot, state: &AppState, msg: &Message, text: &str) -> Result<()> {
    let chat_id = msg.chat.id;
    let (cmd, rest) = command_parts(text);

    match cmd {
        "/setrules" => {
            if !require_admin(bot, msg).await? {
                return Ok(());
            }
            if rest.is_empty() {
                bot.send_message(chat_id, "Usage: /setrules <what counts as spam here>")
                    .await?;
                return Ok(());
            }
            state.store.put(&policy::rules_key(chat_id.0), rest).await?;
            bot.send_message(chat_id, "Spam detection rules updated for this chat.")
                .await?;
        }
        "/setlanguage" => {
            if !require_admin(bot, msg).await? {
                return Ok(());
            }
            if rest.is_empty() {
                bot.send_message(chat_id, "Usage: /setlanguage <language>").await?;
                return Ok(());
            }
            state
                .store
                .put(&policy::language_key(chat_id.0), rest)
                .await?;
            bot.send_message(
                chat_id,
                format!("Moderation reasons will now be written in {}.", rest),
            )
            .await?;
        }
        "/setpunishment" => {
            if !require_admin(bot, msg).await? {
                return Ok(());
            }
            let Ok(punishment) = rest.parse::<Punishment>() else {
                bot.send_message(chat_id, "Valid punishments: delete, mute, kick, ban.")
                    .await?;
                return Ok(());
            };
            state
                .store
                .put(&policy::punishment_key(chat_id.0), punishment.as_str())
                .await?;
            bot.send_message(
                chat_id,
                format!("Spammers in this chat will now get: {}.", punishment),
            )
            .await?;
        }
        "/resetpolicy" => {
            if !require_admin(bot, msg).await? {
                return Ok(());
            }
            state.store.delete(&policy::rules_key(chat_id.0)).await?;
            state.store.delete(&policy::language_key(chat_id.0)).await?;
            state
                .store
                .delete(&policy::punishment_key(chat_id.0))
                .await?;
            bot.send_message(chat_id, "Moderation policy reset to the defaults.")
                .await?;
        }
        "/test" => {
            if !require_admin(bot, msg).await? {
                return Ok(());
            }
            if rest.is_empty() {
                bot.send_message(chat_id, "Usage: /test <message to classify>")
                    .await?;
                return Ok(());
            }
            let policy = state.store.chat_policy(chat_id.0).await;
            let reply = match state
                .classifier
                .classify(&policy.rules, &policy.language, rest)
                .await
            {
                Ok(verdict) => format!(
                    "Verdict: {}\nReason: {}",
                    if verdict.is_spam { "SPAM" } else { "CLEAN" },
                    verdict.reason
                ),
                Err(e) => format!("Classification failed: {}", e),
            };
            bot.send_message(chat_id, reply).await?;
        }
        _ => {}
    }

    Ok(())
}

async fn handle_group_message(bot: Bot, state: AppState, msg: Message) -> Result<()> {
    let Some(text) = msg.text().map(|t| t.to_string()) else {
        return Ok(());
    };
    if text.starts_with('/') {
        handle_group_command(&bot, &state, &msg, &text).await
    } else {
        engine::moderate_message(&bot, &state, &msg).await
    }
}

async fn handle_private_message(bot: Bot, state: AppState, msg: Message) -> Result<()> {
    let Some(text) = msg.text().map(|t| t.trim().to_string()) else {
        return Ok(());
    };
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };

    let (cmd, _rest) = command_parts(&text);
    match cmd {
        "/start" => {
            let records = state.store.violations(user.id.0).await;
            let window = history::display_window(&records);
            let buttons = appeal_buttons(window);
            let mut req = bot.send_message(msg.chat.id, start_text(window));
            if !buttons.is_empty() {
                req = req.reply_markup(InlineKeyboardMarkup::new(buttons));
            }
            req.await?;
        }
        "/help" => {
            bot.send_message(msg.chat.id, help_text()).await?;
        }
        _ => {
            bot.send_message(msg.chat.id, "Use /start or /help.").await?;
        }
    }

    Ok(())
}

async fn handle_callback(bot: Bot, state: AppState, q: CallbackQuery) -> Result<()> {
    let Some(data) = q.data.clone() else {
        return Ok(());
    };

    bot.answer_callback_query(q.id.clone()).await?;

    if let Some(rest) = data.strip_prefix(appeal::CALLBACK_PREFIX) {
        let chat_id: i64 = rest.parse()?;
        appeal::handle_appeal(&bot, &state, &q.from, chat_id).await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    pretty_env_logger::init();

    let bot_token = env::var("TG_BOT_TOKEN").context("Missing TG_BOT_TOKEN")?;
    let api_key = env::var("AI_API_KEY").context("Missing AI_API_KEY")?;
    let base_url = env::var("AI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
    let model = env::var("AI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let db_path = env::var("DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let record_all_punishments = env::var("RECORD_ALL_PUNISHMENTS")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let store = Store::new(db_path);
    store.init()?;

    let bot = Bot::new(bot_token);
    let me = bot.get_me().await.context("getMe failed")?;

    let state = AppState {
        store,
        classifier: Classifier::new(reqwest::Client::new(), base_url, api_key, model.clone()),
        bot_id: me.user.id,
        record_all_punishments,
    };

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::filter(|m: Message| m.chat.is_group() || m.chat.is_supergroup())
                        .endpoint(|bot: Bot, state: AppState, msg: Message| async move {
                            if let Err(e) = handle_group_message(bot, state, msg).await {
                                error!("group handler error: {:?}", e);
                            }
                            Ok::<(), anyhow::Error>(())
                        }),
                )
                .branch(
                    dptree::filter(|m: Message| m.chat.is_private())
                        .endpoint(|bot: Bot, state: AppState, msg: Message| async move {
                            if let Err(e) = handle_private_message(bot, state, msg).await {
                                error!("private handler error: {:?}", e);
                            }
                            Ok::<(), anyhow::Error>(())
                        }),
                ),
        )
        .branch(
            Update::filter_callback_query()
                .endpoint(|bot: Bot, state: AppState, q: CallbackQuery| async move {
                    if let Err(e) = handle_callback(bot, state, q).await {
                        error!("callback handler error: {:?}", e);
                    }
                    Ok::<(), anyhow::Error>(())
                }),
        );

    info!(
        "Bot started as @{} (id {}), model '{}'",
        me.user.username.as_deref().unwrap_or("unknown"),
        me.user.id,
        model
    );

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chat_id: i64, title: &str, handled: bool) -> ViolationRecord {
        ViolationRecord {
            chat_id,
            chat_title: title.to_string(),
            timestamp: 0,
            punishment: Punishment::Mute,
            content: "spam".to_string(),
            reason: "promotional link".to_string(),
            handled,
        }
    }

    #[test]
    fn command_parts_strips_bot_mention_and_splits_args() {
        assert_eq!(
            command_parts("/setrules@SpamWardenBot no job ads"),
            ("/setrules", "no job ads")
        );
        assert_eq!(command_parts("/start"), ("/start", ""));
        assert_eq!(
            command_parts("/test  hello  world"),
            ("/test", "hello  world")
        );
    }

    #[test]
    fn start_text_without_violations_is_just_the_greeting() {
        assert_eq!(start_text(&[]), greeting_text());
    }

    #[test]
    fn start_text_lists_violations_with_status() {
        let window = vec![
            record(-1, "Rust Beginners", false),
            record(-2, "Lounge", true),
        ];
        let out = start_text(&window);
        assert!(out.contains("Rust Beginners"));
        assert!(out.contains("(open)"));
        assert!(out.contains("(resolved)"));
        assert!(out.contains("promotional link"));
    }

    #[test]
    fn appeal_buttons_deduplicate_chats() {
        let window = vec![
            record(-1, "Rust Beginners", false),
            record(-1, "Rust Beginners", false),
            record(-2, "Lounge", false),
        ];
        let rows = appeal_buttons(&window);
        assert_eq!(rows.len(), 2);
        assert!(rows[0][0].text.contains("Rust Beginners"));
        assert!(rows[1][0].text.contains("Lounge"));
    }
}
