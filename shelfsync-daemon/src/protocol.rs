use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shelfsync_core::{Subscription, SubscriptionId, SubscriptionInput};

use crate::controller::SyncRequest;
use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum DaemonRequest {
    Status,
    List,
    Subscribe {
        subscription: SubscriptionInput,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    /// Enqueues a `sync` job; does not wait for it.
    Sync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<SubscriptionId>,
        #[serde(default)]
        all: bool,
        #[serde(default)]
        skip: bool,
    },
    Stop,
}

impl From<SyncRequest> for DaemonRequest {
    fn from(request: SyncRequest) -> Self {
        DaemonRequest::Sync {
            id: request.id,
            all: request.all,
            skip: request.skip,
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// What `list` shows for a subscription. Credentials are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSummary {
    pub id: SubscriptionId,
    pub url: String,
    pub topic: String,
    pub version: u64,
    pub plugins: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Subscription> for SubscriptionSummary {
    fn from(subscription: &Subscription) -> Self {
        Self {
            id: subscription.id.clone(),
            url: subscription.url.clone(),
            topic: subscription.topic(),
            version: subscription.version,
            plugins: subscription.plugins.iter().map(|p| p.name.clone()).collect(),
            updated_at: subscription.updated_at,
        }
    }
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Status with a short retry window, so a daemon that is still binding its
/// socket is not reported as down.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &DaemonRequest::Status) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::Stop)?;
    response_into_data(response).map(|_| ())
}

pub fn request_sync(home: &Path, request: SyncRequest) -> Result<Value, DaemonError> {
    let response = send_request(home, &request.into())?;
    response_into_data(response)
}

pub fn request_subscribe(
    home: &Path,
    subscription: SubscriptionInput,
) -> Result<SubscriptionSummary, DaemonError> {
    let response = send_request(home, &DaemonRequest::Subscribe { subscription })?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

pub fn request_unsubscribe(home: &Path, id: SubscriptionId) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::Unsubscribe { id })?;
    response_into_data(response).map(|_| ())
}

pub fn request_list(home: &Path) -> Result<Vec<SubscriptionSummary>, DaemonError> {
    let response = send_request(home, &DaemonRequest::List)?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_are_tagged_by_cmd() {
        assert_eq!(
            serde_json::to_value(DaemonRequest::Status).unwrap(),
            json!({"cmd": "status"})
        );
        let sync: DaemonRequest =
            serde_json::from_value(json!({"cmd": "sync", "id": "lib", "skip": true})).unwrap();
        assert_eq!(
            sync,
            DaemonRequest::Sync {
                id: Some("lib".into()),
                all: false,
                skip: true
            }
        );
        let subscribe: DaemonRequest = serde_json::from_value(json!({
            "cmd": "subscribe",
            "subscription": {"url": "https://api.example.org/users/1/items"}
        }))
        .unwrap();
        assert!(matches!(subscribe, DaemonRequest::Subscribe { .. }));
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = tempfile::TempDir::new().expect("home");
        let err = send_request(home.path(), &DaemonRequest::Status).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = response_into_data(DaemonResponse::error("no such subscription")).unwrap_err();
        assert_eq!(err.to_string(), "daemon protocol error: no such subscription");
    }
}
