use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{DeviceError, DeviceResult};

use super::{Fallbacks, StatusReport};

const ENDPOINT_REPORT: &str = "/report";
const ENDPOINT_TEMP: &str = "/temp";
const ENDPOINT_TOGGLE: &str = "/toggle";
const ENDPOINT_RELAY: &str = "/relay";

/// Typed operations against the plug. Every call is a single request; retry
/// policy lives in the bridge.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Reads relay and power. `previous_relay` is used when the device omits
    /// or mangles the relay field.
    async fn read_status(&self, previous_relay: Option<bool>) -> DeviceResult<StatusReport>;
    async fn read_temperature(&self) -> DeviceResult<f64>;
    /// Returns the relay state reported by the device, which may differ from
    /// the requested one.
    async fn set_relay(&self, state: bool) -> DeviceResult<bool>;
    async fn toggle_relay(&self) -> DeviceResult<bool>;
}

pub struct HttpDeviceClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDeviceClient {
    pub fn new(ip: IpAddr, timeout: Duration) -> reqwest::Result<Self> {
        let base_url = match ip {
            IpAddr::V4(ip) => format!("http://{ip}"),
            IpAddr::V6(ip) => format!("http://[{ip}]"),
        };
        Self::with_base_url(base_url, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn get(&self, endpoint: &str, query: &[(&str, &str)]) -> DeviceResult<Vec<u8>> {
        let url = format!("{}{}", self.base_url, endpoint);
        debug!("GET {} {:?}", url, query);

        let mut request = self.http.get(&url);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DeviceError::Protocol(e.to_string()))?;

        let body = response.bytes().await?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceClient {
    async fn read_status(&self, previous_relay: Option<bool>) -> DeviceResult<StatusReport> {
        let body = self.get(ENDPOINT_REPORT, &[]).await?;
        parse_report(&body, previous_relay)
    }

    async fn read_temperature(&self) -> DeviceResult<f64> {
        let body = self.get(ENDPOINT_TEMP, &[]).await?;
        parse_temperature(&body)
    }

    async fn set_relay(&self, state: bool) -> DeviceResult<bool> {
        let value = if state { "1" } else { "0" };
        let body = self.get(ENDPOINT_RELAY, &[("state", value)]).await?;
        // The firmware acknowledges an accepted set with an empty body.
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(state);
        }
        parse_relay(&body)
    }

    async fn toggle_relay(&self) -> DeviceResult<bool> {
        let body = self.get(ENDPOINT_TOGGLE, &[]).await?;
        parse_relay(&body)
    }
}

#[derive(Deserialize)]
struct RawReport {
    #[serde(default)]
    relay: Option<Value>,
    #[serde(default)]
    power: Option<Value>,
}

fn parse_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> DeviceResult<T> {
    serde_json::from_slice(body).map_err(|e| DeviceError::Protocol(format!("invalid JSON: {e}")))
}

/// Accepts `true`/`false` and `0`/`1`.
fn relay_value(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 0.0 => Some(false),
            Some(v) if v == 1.0 => Some(true),
            _ => None,
        },
        _ => None,
    }
}

/// Parses a `/report` body. Missing or malformed fields fall back to
/// defaults and are flagged; a negative power reading is rejected.
pub fn parse_report(body: &[u8], previous_relay: Option<bool>) -> DeviceResult<StatusReport> {
    let raw: RawReport = parse_json(body)?;
    let mut fallbacks = Fallbacks::default();

    let relay_state = match raw.relay.as_ref().and_then(relay_value) {
        Some(relay) => relay,
        None => {
            fallbacks.relay = true;
            previous_relay.unwrap_or(false)
        }
    };

    let power_watts = match raw.power.as_ref().and_then(Value::as_f64) {
        Some(power) if power < 0.0 => {
            return Err(DeviceError::Protocol(format!("negative power {power}")));
        }
        Some(power) => power,
        None => {
            fallbacks.power = true;
            0.0
        }
    };

    Ok(StatusReport {
        relay_state,
        power_watts,
        fallbacks,
    })
}

/// Parses a `/temp` body: a bare number, or an object carrying the
/// compensated reading.
pub fn parse_temperature(body: &[u8]) -> DeviceResult<f64> {
    let value: Value = parse_json(body)?;
    let temperature = match &value {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) => map
            .get("compensated")
            .or_else(|| map.get("temperature"))
            .and_then(Value::as_f64),
        _ => None,
    };
    temperature.ok_or_else(|| DeviceError::Protocol(format!("no temperature in {value}")))
}

/// Parses the resulting relay state returned by `/relay` and `/toggle`.
pub fn parse_relay(body: &[u8]) -> DeviceResult<bool> {
    let value: Value = parse_json(body)?;
    let relay = match &value {
        Value::Object(map) => map
            .get("relay")
            .or_else(|| map.get("state"))
            .and_then(relay_value),
        other => relay_value(other),
    };
    relay.ok_or_else(|| DeviceError::Protocol(format!("no relay state in {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Serves one canned response per connection and reports each request line.
    async fn serve(
        responses: Vec<(&'static str, &'static str)>,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buffer = vec![0u8; 4096];
                let read = socket.read(&mut buffer).await.unwrap();
                let request = String::from_utf8_lossy(&buffer[..read]).to_string();
                let line = request.lines().next().unwrap_or_default().to_string();
                let _ = tx.send(line);

                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}"), rx)
    }

    fn client(base_url: String) -> HttpDeviceClient {
        HttpDeviceClient::with_base_url(base_url, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_parse_report() {
        let report = parse_report(br#"{"relay":1,"power":42.5}"#, None).unwrap();
        assert!(report.relay_state);
        assert_eq!(report.power_watts, 42.5);
        assert!(!report.fallbacks.any());

        let report = parse_report(br#"{"relay":false,"power":0,"Ws":1.2}"#, None).unwrap();
        assert!(!report.relay_state);
        assert_eq!(report.power_watts, 0.0);
    }

    #[test]
    fn test_parse_report_fallbacks() {
        let report = parse_report(br#"{"power":3.0}"#, Some(true)).unwrap();
        assert!(report.relay_state);
        assert!(report.fallbacks.relay);
        assert!(!report.fallbacks.power);

        let report = parse_report(br#"{"relay":"yes"}"#, None).unwrap();
        assert!(!report.relay_state);
        assert_eq!(report.power_watts, 0.0);
        assert!(report.fallbacks.relay);
        assert!(report.fallbacks.power);
    }

    #[test]
    fn test_parse_report_errors() {
        assert!(matches!(
            parse_report(br#"{"relay":1,"power":-4.0}"#, None),
            Err(DeviceError::Protocol(_))
        ));
        assert!(matches!(
            parse_report(b"<html>", None),
            Err(DeviceError::Protocol(_))
        ));
        assert!(matches!(
            parse_report(br#""on""#, None),
            Err(DeviceError::Protocol(_))
        ));
    }

    #[test]
    fn test_parse_temperature_shapes() {
        let bare = parse_temperature(b"21.3").unwrap();
        let wrapped =
            parse_temperature(br#"{"measured":27.1,"compensation":5.8,"compensated":21.3}"#)
                .unwrap();
        let named = parse_temperature(br#"{"temperature":21.3}"#).unwrap();

        assert_eq!(bare, 21.3);
        assert_eq!(bare, wrapped);
        assert_eq!(bare, named);

        assert!(parse_temperature(br#"{"measured":27.1}"#).is_err());
        assert!(parse_temperature(br#""warm""#).is_err());
    }

    #[test]
    fn test_parse_relay_shapes() {
        assert!(parse_relay(b"true").unwrap());
        assert!(!parse_relay(b"0").unwrap());
        assert!(parse_relay(br#"{"relay":true}"#).unwrap());
        assert!(!parse_relay(br#"{"state":0}"#).unwrap());
        assert!(parse_relay(b"2").is_err());
        assert!(parse_relay(b"{}").is_err());
    }

    #[tokio::test]
    async fn test_read_status_and_temperature() {
        let (base_url, mut requests) = serve(vec![
            ("200 OK", r#"{"relay":1,"power":42.5}"#),
            ("200 OK", r#"{"compensated":21.3}"#),
        ])
        .await;
        let client = client(base_url);

        let report = client.read_status(None).await.unwrap();
        assert!(report.relay_state);
        assert_eq!(report.power_watts, 42.5);
        assert_eq!(requests.recv().await.unwrap(), "GET /report HTTP/1.1");

        assert_eq!(client.read_temperature().await.unwrap(), 21.3);
        assert_eq!(requests.recv().await.unwrap(), "GET /temp HTTP/1.1");
    }

    #[tokio::test]
    async fn test_set_relay_and_toggle() {
        let (base_url, mut requests) = serve(vec![
            ("200 OK", ""),
            ("200 OK", r#"{"relay":false}"#),
            ("200 OK", r#"{"relay":true}"#),
        ])
        .await;
        let client = client(base_url);

        assert!(client.set_relay(true).await.unwrap());
        assert_eq!(requests.recv().await.unwrap(), "GET /relay?state=1 HTTP/1.1");

        // the device may refuse the change; its answer wins
        assert!(!client.set_relay(true).await.unwrap());
        assert_eq!(requests.recv().await.unwrap(), "GET /relay?state=1 HTTP/1.1");

        assert!(client.toggle_relay().await.unwrap());
        assert_eq!(requests.recv().await.unwrap(), "GET /toggle HTTP/1.1");
    }

    #[tokio::test]
    async fn test_http_error_is_protocol_error() {
        let (base_url, _requests) = serve(vec![("500 Internal Server Error", "{}")]).await;
        let err = client(base_url).read_status(None).await.unwrap_err();
        assert!(matches!(err, DeviceError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{addr}"))
            .read_temperature()
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client =
            HttpDeviceClient::with_base_url(format!("http://{addr}"), Duration::from_millis(200))
                .unwrap();
        let err = client.toggle_relay().await.unwrap_err();
        assert!(matches!(err, DeviceError::Unreachable(_)));
    }
}
