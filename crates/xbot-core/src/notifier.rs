//! Chat platform delivery.
//!
//! The upload manager only sees [`ChatNotifier`]; [`TelegramNotifier`] is the
//! Bot API implementation.

use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::DeliveryError;
use crate::media::MediaType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn from_media_type(media_type: MediaType) -> Option<Self> {
        match media_type {
            MediaType::Image => Some(MediaKind::Photo),
            MediaType::Video => Some(MediaKind::Video),
            MediaType::Space | MediaType::Broadcast => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }
}

/// One media item to send, uploaded from local bytes.
#[derive(Debug, Clone)]
pub struct OutgoingMedia {
    pub data: Vec<u8>,
    pub file_name: String,
    pub kind: MediaKind,
    pub caption: Option<String>,
}

pub trait ChatNotifier {
    fn send_text(&self, chat_id: &str, text: &str) -> Result<i64, DeliveryError>;

    fn send_single_media(&self, chat_id: &str, media: OutgoingMedia) -> Result<i64, DeliveryError>;

    /// Returns one message id per delivered item, in submission order.
    fn send_media_group(
        &self,
        chat_id: &str,
        media: Vec<OutgoingMedia>,
    ) -> Result<Vec<i64>, DeliveryError>;
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

/// Telegram Bot API client.
pub struct TelegramNotifier {
    client: Client,
    base: String,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_base, bot_token))
    }

    pub fn with_client(client: Client, api_base: &str, bot_token: &str) -> Self {
        Self {
            client,
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base, method)
    }
}

fn file_part(data: Vec<u8>, file_name: &str) -> Result<Part, DeliveryError> {
    let mime = mime_guess::from_path(file_name).first_or_octet_stream();
    Ok(Part::bytes(data)
        .file_name(file_name.to_string())
        .mime_str(mime.essence_str())?)
}

/// Decode a Bot API answer, mapping size rejections to `FileTooLarge`.
fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, DeliveryError> {
    let status = resp.status();
    if status.as_u16() == 413 {
        return Err(DeliveryError::FileTooLarge("rejected by platform (413)".to_string()));
    }
    let body: ApiResponse<T> = resp
        .json()
        .map_err(|e| DeliveryError::Api(format!("unreadable response ({}): {}", status, e)))?;

    if body.ok {
        if let Some(result) = body.result {
            return Ok(result);
        }
    }
    let description = body.description.unwrap_or_else(|| format!("status {}", status));
    if is_size_rejection(body.error_code, &description) {
        return Err(DeliveryError::FileTooLarge(description));
    }
    Err(DeliveryError::Api(description))
}

/// Telegram reports oversized uploads as 413 or as a 400 saying
/// "file is too big"; other deployments say "too large".
fn is_size_rejection(error_code: Option<u16>, description: &str) -> bool {
    let description = description.to_lowercase();
    error_code == Some(413) || description.contains("too large") || description.contains("too big")
}

impl ChatNotifier for TelegramNotifier {
    fn send_text(&self, chat_id: &str, text: &str) -> Result<i64, DeliveryError> {
        let resp = self
            .client
            .post(self.url("sendMessage"))
            .json(&json!({"chat_id": chat_id, "text": text}))
            .send()?;
        decode::<SentMessage>(resp).map(|m| m.message_id)
    }

    fn send_single_media(&self, chat_id: &str, media: OutgoingMedia) -> Result<i64, DeliveryError> {
        let field = media.kind.as_str();
        let mut form = Form::new().text("chat_id", chat_id.to_string());
        if let Some(caption) = media.caption {
            form = form.text("caption", caption);
        }
        form = form.part(field, file_part(media.data, &media.file_name)?);

        let method = match media.kind {
            MediaKind::Photo => "sendPhoto",
            MediaKind::Video => "sendVideo",
        };
        let resp = self.client.post(self.url(method)).multipart(form).send()?;
        decode::<SentMessage>(resp).map(|m| m.message_id)
    }

    fn send_media_group(
        &self,
        chat_id: &str,
        media: Vec<OutgoingMedia>,
    ) -> Result<Vec<i64>, DeliveryError> {
        let mut form = Form::new().text("chat_id", chat_id.to_string());
        let mut descriptors: Vec<Value> = Vec::with_capacity(media.len());

        for (i, item) in media.into_iter().enumerate() {
            let attach = format!("file{}", i);
            form = form.part(attach.clone(), file_part(item.data, &item.file_name)?);
            let mut descriptor = json!({"type": item.kind.as_str(), "media": format!("attach://{}", attach)});
            if let Some(caption) = item.caption {
                descriptor["caption"] = Value::String(caption);
            }
            descriptors.push(descriptor);
        }

        let media_json = serde_json::to_string(&descriptors)
            .map_err(|e| DeliveryError::Api(format!("failed to encode media group: {}", e)))?;
        form = form.text("media", media_json);

        let resp = self.client.post(self.url("sendMediaGroup")).multipart(form).send()?;
        let sent: Vec<SentMessage> = decode(resp)?;
        Ok(sent.into_iter().map(|m| m.message_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Answer exactly one HTTP request with `status` and a JSON `body`.
    fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut request_body = vec![0u8; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        (format!("http://{}", addr), handle)
    }

    fn local_notifier(base: &str) -> TelegramNotifier {
        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        TelegramNotifier::with_client(client, base, "T0K")
    }

    #[test]
    fn test_file_is_too_big_reply_is_size_rejection() {
        let (base, server) = serve_once(
            "400 Bad Request",
            r#"{"ok":false,"error_code":400,"description":"Bad Request: file is too big"}"#,
        );
        let result = local_notifier(&base).send_text("@chan", "hello");
        server.join().unwrap();
        match result {
            Err(DeliveryError::FileTooLarge(reason)) => assert!(reason.contains("too big")),
            other => panic!("expected FileTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_other_bad_request_is_api_error() {
        let (base, server) = serve_once(
            "400 Bad Request",
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        );
        let result = local_notifier(&base).send_text("@chan", "hello");
        server.join().unwrap();
        assert!(matches!(result, Err(DeliveryError::Api(ref d)) if d.contains("chat not found")));
    }

    #[test]
    fn test_successful_send_returns_message_id() {
        let (base, server) =
            serve_once("200 OK", r#"{"ok":true,"result":{"message_id":77,"chat":{"id":1}}}"#);
        let result = local_notifier(&base).send_text("@chan", "hello");
        server.join().unwrap();
        assert_eq!(result.unwrap(), 77);
    }

    #[test]
    fn test_size_rejection_wording() {
        assert!(is_size_rejection(Some(413), "Request Entity Too Large"));
        assert!(is_size_rejection(Some(400), "Bad Request: file is too big"));
        assert!(is_size_rejection(None, "File Too Large"));
        assert!(!is_size_rejection(Some(400), "Bad Request: wrong file identifier"));
    }

    #[test]
    fn test_media_kind_mapping() {
        assert_eq!(MediaKind::from_media_type(MediaType::Image), Some(MediaKind::Photo));
        assert_eq!(MediaKind::from_media_type(MediaType::Video), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_media_type(MediaType::Space), None);
    }

    #[test]
    fn test_api_response_shapes() {
        let ok: ApiResponse<SentMessage> =
            serde_json::from_str(r#"{"ok": true, "result": {"message_id": 42, "chat": {}}}"#).unwrap();
        assert_eq!(ok.result.unwrap().message_id, 42);

        let group: ApiResponse<Vec<SentMessage>> =
            serde_json::from_str(r#"{"ok": true, "result": [{"message_id": 1}, {"message_id": 2}]}"#)
                .unwrap();
        assert_eq!(group.result.unwrap().len(), 2);

        let err: ApiResponse<SentMessage> = serde_json::from_str(
            r#"{"ok": false, "error_code": 413, "description": "Request Entity Too Large"}"#,
        )
        .unwrap();
        assert!(!err.ok);
        assert_eq!(err.error_code, Some(413));
    }

    #[test]
    fn test_notifier_url() {
        let n = TelegramNotifier::new("https://api.telegram.org/", "T0K", Duration::from_secs(5)).unwrap();
        assert_eq!(n.url("sendMessage"), "https://api.telegram.org/botT0K/sendMessage");
    }
}
