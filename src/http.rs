//! AMI over Asterisk's HTTP server (`/rawman`)
//!
//! Each action is one `GET <base>/rawman?Action=...&ActionID=...` request.
//! The session cookie (`mansession_id`) set by `Login` is kept in the client's
//! cookie store. The body carries ordinary AMI blocks: the first answers the
//! action, the rest are events queued for the session since the last request.

use crate::{
    action::Action,
    constants::{BLOCK_TERMINATOR, HTTP_RAWMAN_PATH, HTTP_SESSION_COOKIE},
    error::AmiResult,
    message::Message,
    protocol::AmiParser,
};
use std::time::Duration;
use tracing::{debug, trace, warn};
use url::Url;

/// Resolve `<base>/rawman`, tolerating a base with or without trailing slash.
pub(crate) fn rawman_url(base: &str) -> AmiResult<Url> {
    let mut base = Url::parse(base)?;
    if !base
        .path()
        .ends_with('/')
    {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(HTTP_RAWMAN_PATH)?)
}

fn request_url(endpoint: &Url, action: &Action) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        for (name, value) in action.fields() {
            query.append_pair(name, value);
        }
    }
    url
}

fn sets_session_cookie(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with(HTTP_SESSION_COOKIE))
}

/// Split a `/rawman` body into messages. Malformed blocks are skipped.
pub(crate) fn parse_body(body: &str) -> Vec<Message> {
    let mut parser = AmiParser::new();
    let mut messages = Vec::new();
    let mut feed = |data: &[u8]| {
        if let Err(e) = parser.add_data(data) {
            warn!("[HTTP] {}", e);
            return;
        }
        loop {
            match parser.parse_message() {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => break,
                Err(e) => warn!("[HTTP] Dropping block: {}", e),
            }
        }
    };
    feed(body.as_bytes());
    // Some servers omit the final blank line.
    if !body
        .trim_end_matches(['\r', '\n'])
        .is_empty()
        && !body.ends_with(BLOCK_TERMINATOR)
    {
        feed(BLOCK_TERMINATOR.as_bytes());
    }
    messages
}

/// Turn a request outcome into the message list callers see: failures become
/// a single synthesized `Response: Error` for the action.
fn into_messages(action: &Action, outcome: Result<String, String>) -> Vec<Message> {
    match outcome {
        Ok(body) => {
            trace!("[HTTP] Body: {:?}", body);
            let messages = parse_body(&body);
            if messages.is_empty() {
                return vec![Message::error_response(
                    Some(action.id()),
                    "empty response from server",
                )];
            }
            messages
        }
        Err(reason) => {
            warn!("[HTTP] {} failed: {}", action.name().unwrap_or("?"), reason);
            vec![Message::error_response(Some(action.id()), &reason)]
        }
    }
}

/// Async `/rawman` client.
#[derive(Debug, Clone)]
pub(crate) struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub(crate) fn new(base: &str, timeout: Duration) -> AmiResult<Self> {
        let endpoint = rawman_url(base)?;
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        debug!("[HTTP] Using endpoint {}", endpoint);
        Ok(Self { client, endpoint })
    }

    /// Send one action. Never fails: transport errors come back as a failed
    /// response message.
    pub(crate) async fn exchange(&self, action: &Action) -> Vec<Message> {
        debug!("[SEND] {} (http)", action.name().unwrap_or("?"));
        let url = request_url(&self.endpoint, action);
        let outcome = async {
            let response = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?;
            if sets_session_cookie(response.headers()) {
                debug!("[HTTP] Server issued {}", HTTP_SESSION_COOKIE);
            }
            response
                .text()
                .await
        }
        .await
        .map_err(|e: reqwest::Error| e.to_string());
        into_messages(action, outcome)
    }
}

/// Blocking `/rawman` client for [`ExecutionMode::Sync`](crate::ExecutionMode::Sync).
///
/// Must not be used from inside a tokio runtime.
#[derive(Debug, Clone)]
pub(crate) struct BlockingHttpTransport {
    client: reqwest::blocking::Client,
    endpoint: Url,
}

impl BlockingHttpTransport {
    pub(crate) fn new(base: &str, timeout: Duration) -> AmiResult<Self> {
        let endpoint = rawman_url(base)?;
        let client = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .timeout(timeout)
            .build()?;
        debug!("[HTTP] Using endpoint {} (blocking)", endpoint);
        Ok(Self { client, endpoint })
    }

    pub(crate) fn exchange(&self, action: &Action) -> Vec<Message> {
        debug!("[SEND] {} (http, blocking)", action.name().unwrap_or("?"));
        let url = request_url(&self.endpoint, action);
        let outcome = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| {
                if sets_session_cookie(r.headers()) {
                    debug!("[HTTP] Server issued {}", HTTP_SESSION_COOKIE);
                }
                r.text()
            })
            .map_err(|e| e.to_string());
        into_messages(action, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rawman_url() {
        assert_eq!(
            rawman_url("http://pbx:8088/asterisk/")
                .unwrap()
                .as_str(),
            "http://pbx:8088/asterisk/rawman"
        );
        assert_eq!(
            rawman_url("http://pbx:8088/asterisk")
                .unwrap()
                .as_str(),
            "http://pbx:8088/asterisk/rawman"
        );
        assert_eq!(
            rawman_url("http://pbx:8088")
                .unwrap()
                .as_str(),
            "http://pbx:8088/rawman"
        );
        assert!(rawman_url("not a url").is_err());
    }

    #[test]
    fn test_request_url_carries_fields() {
        let endpoint = rawman_url("http://pbx:8088/asterisk/").unwrap();
        let action = Action::new([("Action", "Command"), ("ActionID", "h1"), ("Command", "core show uptime")]);
        let url = request_url(&endpoint, &action);
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            [
                ("Action".to_string(), "Command".to_string()),
                ("ActionID".to_string(), "h1".to_string()),
                ("Command".to_string(), "core show uptime".to_string()),
            ]
        );
    }

    #[test]
    fn test_session_cookie_detected() {
        use reqwest::header::{HeaderMap, HeaderValue, SET_COOKIE};
        let mut headers = HeaderMap::new();
        assert!(!sets_session_cookie(&headers));
        headers.append(SET_COOKIE, HeaderValue::from_static("other=1"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("mansession_id=\"5e2f\"; Version=1; Max-Age=60"),
        );
        assert!(sets_session_cookie(&headers));
    }

    #[test]
    fn test_parse_body_response_then_events() {
        let body = "Response: Success\r\nActionID: h1\r\nPing: Pong\r\n\r\n\
                    Event: PeerStatus\r\nPeer: SIP/1\r\n\r\n\
                    Event: Hangup\r\nChannel: SIP/1-0001\r\n";
        let messages = parse_body(body);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].action_id(), Some("h1"));
        assert_eq!(messages[2].matches(), Some("Hangup"));
    }

    #[test]
    fn test_failure_becomes_error_response() {
        let action = Action::new([("Action", "Ping"), ("ActionID", "h2")]);
        let messages = into_messages(&action, Err("connection refused".into()));
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].success());
        assert_eq!(messages[0].action_id(), Some("h2"));
        assert_eq!(messages[0].message_text(), Some("connection refused"));

        let empty = into_messages(&action, Ok(String::new()));
        assert!(!empty[0].success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_failed_response() {
        let transport = HttpTransport::new("http://127.0.0.1:1/", Duration::from_secs(2)).unwrap();
        let messages = transport
            .exchange(&Action::ping())
            .await;
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].success());
    }
}
