//! Teams bot activity handling.

use crate::clients::bot_framework::Activity;
use crate::clients::{BotConnector, ClientError};

pub const EMPTY_QUERY_TEXT: &str = "何か質問がありますか？";
pub const WELCOME_TEXT: &str =
    "こんにちは！Teams BOTへようこそ。私にメンションして質問してください。";

/// The reply an activity calls for, if any.
///
/// Messages are answered only when they mention the bot; the mention is
/// removed from the text before answering.
pub fn reply_for(activity: &Activity) -> Option<String> {
    let bot_id = activity.recipient.id.as_str();
    match activity.kind.as_str() {
        "message" => {
            let text = activity.text.as_deref().unwrap_or_default();
            if bot_id.is_empty() || !text.contains(bot_id) {
                tracing::info!("Message without bot mention; ignoring");
                return None;
            }
            let query = text.replace(bot_id, "");
            let query = query.trim();
            if query.is_empty() {
                Some(EMPTY_QUERY_TEXT.to_string())
            } else {
                Some(format!("エコー: {}", query))
            }
        }
        "conversationUpdate" => activity
            .members_added
            .iter()
            .any(|member| member.id == bot_id)
            .then(|| WELCOME_TEXT.to_string()),
        other => {
            tracing::info!(kind = other, "Ignoring activity type");
            None
        }
    }
}

pub async fn handle_activity(bot: &dyn BotConnector, activity: &Activity) -> Result<(), ClientError> {
    let Some(text) = reply_for(activity) else {
        return Ok(());
    };
    bot.reply(activity, &text).await?;
    tracing::info!(kind = %activity.kind, conversation = %activity.conversation.id, "Sent Teams reply");
    Ok(())
}
