//! Telegram bot client, the device's out-of-band channel.
//!
//! Logs, crash archives and vitals go out through here; remote control
//! commands (`!restart`, `!log`) come back in. Sends are serialized behind a
//! single mutex and rate-limited to one API call per 500 ms.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Minimum spacing between two API calls.
const MAX_SEND_INTERVAL: Duration = Duration::from_millis(500);

/// Hard cap on a single Telegram message.
const MAX_MESSAGE: usize = 4096;
/// Room reserved for the `" (n)"` fragment counter.
const POSTFIX_LEN: usize = 4;
const FRAGMENT: usize = MAX_MESSAGE - POSTFIX_LEN;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("empty message")]
    Empty,

    #[error("message too long")]
    TooLong,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telegram API error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    edited_message: Option<Message>,
    channel_post: Option<Message>,
    edited_channel_post: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    text: Option<String>,
}

pub struct Bot {
    http: reqwest::Client,
    base: String,
    channel_id: i64,
    cancel: CancellationToken,
    gate: Mutex<Instant>,
}

impl Bot {
    pub fn new(cancel: CancellationToken, token: &str, channel_id: i64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base: format!("https://api.telegram.org/bot{token}"),
            channel_id,
            cancel,
            gate: Mutex::new(Instant::now()),
        }
    }

    /// Send a text message to the channel. Long texts are fragmented per
    /// [`split_message`]; `silent` suppresses the client-side notification.
    pub async fn send(&self, text: &str, silent: bool) -> Result<(), NotifyError> {
        let fragments = split_message(text)?;

        let mut gate = self.gate.lock().await;
        for fragment in fragments {
            self.wait_turn(&mut gate).await;

            let resp: ApiResponse<serde_json::Value> = self
                .http
                .post(format!("{}/sendMessage", self.base))
                .json(&serde_json::json!({
                    "chat_id": self.channel_id,
                    "text": fragment,
                    "disable_notification": silent,
                }))
                .send()
                .await?
                .json()
                .await?;

            if !resp.ok {
                return Err(NotifyError::Api(
                    resp.description.unwrap_or_else(|| "unknown".into()),
                ));
            }
        }

        Ok(())
    }

    /// Upload a document to the channel.
    pub async fn send_file(
        &self,
        data: Vec<u8>,
        filename: &str,
        silent: bool,
    ) -> Result<(), NotifyError> {
        let mut gate = self.gate.lock().await;
        self.wait_turn(&mut gate).await;

        let form = reqwest::multipart::Form::new()
            .text("chat_id", self.channel_id.to_string())
            .text("disable_notification", silent.to_string())
            .part(
                "document",
                reqwest::multipart::Part::bytes(data).file_name(filename.to_owned()),
            );

        let resp: ApiResponse<serde_json::Value> = self
            .http
            .post(format!("{}/sendDocument", self.base))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            return Err(NotifyError::Api(
                resp.description.unwrap_or_else(|| "unknown".into()),
            ));
        }
        Ok(())
    }

    /// Long-poll for incoming messages and hand each text to `callback`.
    /// Returns on cancellation or on the first transport error; the caller
    /// is expected to re-invoke with backoff.
    pub async fn handle_messages(
        &self,
        mut callback: impl FnMut(&str),
        only_new: bool,
    ) -> Result<(), NotifyError> {
        let mut offset: i64 = 0;

        if only_new {
            // skip the backlog: a zero-timeout poll tells us the newest id
            let pending = self.get_updates(offset, 0).await?;
            if let Some(last) = pending.last() {
                offset = last.update_id + 1;
            }
        }

        loop {
            let updates = tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                r = self.get_updates(offset, 60) => r?,
            };

            for u in updates {
                offset = offset.max(u.update_id + 1);
                for msg in [
                    &u.message,
                    &u.edited_message,
                    &u.channel_post,
                    &u.edited_channel_post,
                ] {
                    if let Some(text) = msg.as_ref().and_then(|m| m.text.as_deref()) {
                        debug!(%text, "incoming telegram message");
                        callback(text);
                    }
                }
            }
        }
    }

    async fn get_updates(&self, offset: i64, timeout: u64) -> Result<Vec<Update>, NotifyError> {
        let resp: ApiResponse<Vec<Update>> = self
            .http
            .post(format!("{}/getUpdates", self.base))
            .json(&serde_json::json!({
                "offset": offset,
                "timeout": timeout,
            }))
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            return Err(NotifyError::Api(
                resp.description.unwrap_or_else(|| "unknown".into()),
            ));
        }
        Ok(resp.result.unwrap_or_default())
    }

    async fn wait_turn(&self, gate: &mut Instant) {
        let now = Instant::now();
        if *gate > now {
            tokio::time::sleep_until(*gate).await;
        }
        *gate = Instant::now() + MAX_SEND_INTERVAL;
    }
}

/// Break `text` into sendable fragments. Texts under the API limit pass
/// through untouched; longer ones are cut at UTF-8 boundaries into
/// 4092-byte pieces suffixed with a `" (n)"` counter. Nine fragments should
/// be enough for everybody.
fn split_message(text: &str) -> Result<Vec<String>, NotifyError> {
    if text.is_empty() {
        return Err(NotifyError::Empty);
    }
    if text.len() > 9 * FRAGMENT {
        return Err(NotifyError::TooLong);
    }
    if text.len() < MAX_MESSAGE {
        return Ok(vec![text.to_owned()]);
    }

    let mut fragments = Vec::new();
    let mut rest = text;
    let mut n = 1;
    while !rest.is_empty() {
        let mut end = rest.len().min(FRAGMENT);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        fragments.push(format!("{head} ({n})"));
        rest = tail;
        n += 1;
    }
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_rejected() {
        assert!(matches!(split_message(""), Err(NotifyError::Empty)));
    }

    #[test]
    fn short_text_passes_through() {
        let f = split_message("hello").unwrap();
        assert_eq!(f, vec!["hello".to_string()]);
    }

    #[test]
    fn just_under_limit_is_single() {
        let text = "a".repeat(MAX_MESSAGE - 1);
        let f = split_message(&text).unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0], text);
    }

    #[test]
    fn long_text_is_fragmented_with_counter() {
        let text = "a".repeat(FRAGMENT * 2 + 10);
        let f = split_message(&text).unwrap();
        assert_eq!(f.len(), 3);
        assert!(f[0].ends_with(" (1)"));
        assert!(f[1].ends_with(" (2)"));
        assert!(f[2].ends_with(" (3)"));
        assert!(f[0].len() <= MAX_MESSAGE);
    }

    #[test]
    fn fragment_count_is_len_over_4092() {
        let text = "x".repeat(FRAGMENT * 5);
        let f = split_message(&text).unwrap();
        assert_eq!(f.len(), 5);
    }

    #[test]
    fn oversize_is_rejected() {
        // exactly nine full fragments is still sendable
        let text = "a".repeat(9 * FRAGMENT);
        let f = split_message(&text).unwrap();
        assert_eq!(f.len(), 9);
        assert!(f[8].ends_with(" (9)"));

        let text = "a".repeat(9 * FRAGMENT + 1);
        assert!(matches!(split_message(&text), Err(NotifyError::TooLong)));
    }

    #[test]
    fn multibyte_boundaries_are_respected() {
        let text = "é".repeat(FRAGMENT); // 2 bytes each, forces fragmentation
        let f = split_message(&text).unwrap();
        assert!(f.len() >= 2);
        for frag in &f {
            assert!(frag.is_char_boundary(frag.len() - POSTFIX_LEN));
        }
    }
}
