use std::sync::Arc;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{debug, error, info, warn};

use crate::bot::Router;
use crate::platform::IncomingMessage;

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Run the Telegram long-polling loop until Ctrl-C
pub async fn run(router: Arc<Router>, bot: Bot) -> Result<()> {
    info!("Starting Telegram platform...");

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![router])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, router: Arc<Router>) -> ResponseResult<()> {
    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => return Ok(()),
    };

    let incoming = IncomingMessage {
        chat_id: msg.chat.id.0.to_string(),
        user_name: msg
            .from
            .as_ref()
            .map(|user| user.first_name.clone())
            .unwrap_or_default(),
        text,
    };

    debug!(
        "Telegram message from {} ({}): {}",
        incoming.user_name, incoming.chat_id, incoming.text
    );

    let command = incoming.command();
    let reply = router
        .handle(&incoming.chat_id, command.name, command.args)
        .await;

    for chunk in split_message(&reply, 4000) {
        if let Err(e) = bot
            .send_message(msg.chat.id, chunk)
            .parse_mode(ParseMode::Markdown)
            .await
        {
            error!("Failed to send reply to {}: {}", incoming.chat_id, e);
        }
    }

    Ok(())
}
