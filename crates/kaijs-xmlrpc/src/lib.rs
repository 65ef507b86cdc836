//! Minimal XML-RPC client for the buildsys `getBuild(build_id)` enrichment
//! lookup (§4.6). The wire protocol itself is out of scope for this
//! pipeline; this crate is a thin adapter — encode one int param, decode one
//! struct response — wrapped in the shared retry policy.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use kaijs_error::{ErrorCode, KaijsError};
use kaijs_retry::{retry_async, RetryConfig};
use serde_json::{Map, Value};
use std::time::Duration;

/// Result of a `getBuild` call: the raw struct response, not yet validated
/// against the `koji_build_info` schema (that happens in the calling
/// handler, per §4.6).
#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    /// The decoded `<struct>` response as a JSON object.
    pub raw: Value,
}

/// Abstraction over the buildsys enrichment lookup, so handlers and tests
/// can swap in a mock without touching the wire format.
#[async_trait]
pub trait BuildsysClient: Send + Sync {
    /// Calls `getBuild(build_id)` and returns the decoded response.
    async fn get_build(&self, build_id: u64) -> Result<BuildInfo, KaijsError>;
}

/// Real XML-RPC client over HTTP, retried per [`RetryConfig::buildsys_default`].
pub struct HttpBuildsysClient {
    endpoint: String,
    http: reqwest::Client,
    retry_config: RetryConfig,
}

impl HttpBuildsysClient {
    /// Builds a client against `endpoint` (the buildsys XML-RPC URL) with a
    /// 30s per-request timeout and the buildsys retry policy.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, KaijsError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
            retry_config: RetryConfig::buildsys_default(),
        })
    }

    async fn call_once(&self, build_id: u64) -> Result<BuildInfo, KaijsError> {
        let body = encode_get_build_request(build_id);
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| KaijsError::new(ErrorCode::ConnectionLost, format!("getBuild request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(KaijsError::new(
                ErrorCode::ConnectionLost,
                format!("getBuild returned HTTP {}", response.status()),
            ));
        }

        let text = response
            .text()
            .await
            .map_err(|e| KaijsError::new(ErrorCode::ConnectionLost, format!("reading getBuild body failed: {e}")))?;

        decode_get_build_response(&text)
    }
}

#[async_trait]
impl BuildsysClient for HttpBuildsysClient {
    async fn get_build(&self, build_id: u64) -> Result<BuildInfo, KaijsError> {
        let outcome = retry_async(
            &self.retry_config,
            || self.call_once(build_id),
            |err| err.code == ErrorCode::ConnectionLost,
        )
        .await
        .map_err(|e| match e {
            kaijs_retry::RetryError::Operation(inner) => inner,
            kaijs_retry::RetryError::Timeout(d) => {
                KaijsError::new(ErrorCode::ConnectionLost, format!("getBuild timed out after {d:?}"))
            }
        })?;
        Ok(outcome.value)
    }
}

/// In-memory client for handler tests, returning canned responses keyed by
/// `build_id`.
#[derive(Debug, Default)]
pub struct MockBuildsysClient {
    responses: std::collections::HashMap<u64, Value>,
}

impl MockBuildsysClient {
    /// Creates an empty mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the struct response returned for `build_id`.
    pub fn with_response(mut self, build_id: u64, raw: Value) -> Self {
        self.responses.insert(build_id, raw);
        self
    }
}

#[async_trait]
impl BuildsysClient for MockBuildsysClient {
    async fn get_build(&self, build_id: u64) -> Result<BuildInfo, KaijsError> {
        self.responses
            .get(&build_id)
            .cloned()
            .map(|raw| BuildInfo { raw })
            .ok_or_else(|| {
                KaijsError::new(ErrorCode::Internal, format!("no mocked getBuild response for {build_id}"))
            })
    }
}

fn encode_get_build_request(build_id: u64) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<methodCall><methodName>getBuild</methodName>\
         <params><param><value><int>{build_id}</int></value></param></params></methodCall>"
    )
}

/// Decodes a buildsys XML-RPC response into a [`BuildInfo`]. Supports the
/// subset of XML-RPC this pipeline needs: a single `<struct>` response, or a
/// `<fault>` envelope.
fn decode_get_build_response(xml: &str) -> Result<BuildInfo, KaijsError> {
    if let Some(fault_body) = between(xml, "<fault>", "</fault>") {
        let value = parse_value(between(fault_body, "<value>", "</value>").unwrap_or(fault_body))?;
        return Err(KaijsError::new(
            ErrorCode::ConnectionLost,
            format!("getBuild returned a fault: {value}"),
        ));
    }

    let params = between(xml, "<params>", "</params>").ok_or_else(|| {
        KaijsError::new(ErrorCode::Internal, "getBuild response has neither <params> nor <fault>")
    })?;
    let param = between(params, "<param>", "</param>").ok_or_else(|| {
        KaijsError::new(ErrorCode::Internal, "getBuild <params> has no <param>")
    })?;
    let value_xml = between(param, "<value>", "</value>")
        .ok_or_else(|| KaijsError::new(ErrorCode::Internal, "getBuild <param> has no <value>"))?;

    let value = parse_value(value_xml)?;
    Ok(BuildInfo { raw: value })
}

fn parse_value(xml: &str) -> Result<Value, KaijsError> {
    let xml = xml.trim();
    if let Some(inner) = between(xml, "<struct>", "</struct>") {
        let mut map = Map::new();
        let mut rest = inner;
        while let Some(member_start) = rest.find("<member>") {
            let after = &rest[member_start + "<member>".len()..];
            let member_end = after
                .find("</member>")
                .ok_or_else(|| KaijsError::new(ErrorCode::Internal, "unterminated <member>"))?;
            let member_xml = &after[..member_end];
            let name = between(member_xml, "<name>", "</name>")
                .ok_or_else(|| KaijsError::new(ErrorCode::Internal, "<member> missing <name>"))?
                .trim()
                .to_string();
            let value_xml = between(member_xml, "<value>", "</value>")
                .ok_or_else(|| KaijsError::new(ErrorCode::Internal, "<member> missing <value>"))?;
            map.insert(name, parse_value(value_xml)?);
            rest = &after[member_end + "</member>".len()..];
        }
        return Ok(Value::Object(map));
    }

    if let Some(inner) = between(xml, "<array>", "</array>") {
        let data = between(inner, "<data>", "</data>").unwrap_or(inner);
        let mut items = Vec::new();
        let mut rest = data;
        while let Some(value_start) = rest.find("<value>") {
            let after = &rest[value_start + "<value>".len()..];
            let value_end = after
                .find("</value>")
                .ok_or_else(|| KaijsError::new(ErrorCode::Internal, "unterminated <value>"))?;
            items.push(parse_value(&after[..value_end])?);
            rest = &after[value_end + "</value>".len()..];
        }
        return Ok(Value::Array(items));
    }

    if let Some(s) = between(xml, "<string>", "</string>") {
        return Ok(Value::String(s.to_string()));
    }
    if let Some(s) = between(xml, "<int>", "</int>").or_else(|| between(xml, "<i4>", "</i4>")) {
        return s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|e| KaijsError::new(ErrorCode::Internal, format!("bad <int>: {e}")));
    }
    if let Some(s) = between(xml, "<double>", "</double>") {
        return s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| KaijsError::new(ErrorCode::Internal, "bad <double>"));
    }
    if let Some(s) = between(xml, "<boolean>", "</boolean>") {
        return Ok(Value::Bool(s.trim() == "1"));
    }
    if xml.contains("<nil/>") {
        return Ok(Value::Null);
    }

    // XML-RPC permits a bare string with no <string> tag.
    Ok(Value::String(xml.trim().to_string()))
}

fn between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let start_idx = haystack.find(start)? + start.len();
    let end_idx = haystack[start_idx..].find(end)? + start_idx;
    Some(&haystack[start_idx..end_idx])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn encodes_int_param_request() {
        let xml = encode_get_build_request(12345);
        assert!(xml.contains("<methodName>getBuild</methodName>"));
        assert!(xml.contains("<int>12345</int>"));
    }

    #[test]
    fn decodes_struct_response() {
        let xml = r#"<?xml version="1.0"?>
<methodResponse><params><param><value><struct>
<member><name>nvr</name><value><string>foo-1-1.fc40</string></value></member>
<member><name>build_id</name><value><int>12345</int></value></member>
</struct></value></param></params></methodResponse>"#;
        let info = decode_get_build_response(xml).unwrap();
        assert_eq!(info.raw["nvr"], json!("foo-1-1.fc40"));
        assert_eq!(info.raw["build_id"], json!(12345));
    }

    #[test]
    fn decodes_nested_array_member() {
        let xml = r#"<methodResponse><params><param><value><struct>
<member><name>tags</name><value><array><data>
<value><string>f40</string></value>
<value><string>f40-updates</string></value>
</data></array></value></member>
</struct></value></param></params></methodResponse>"#;
        let info = decode_get_build_response(xml).unwrap();
        assert_eq!(info.raw["tags"], json!(["f40", "f40-updates"]));
    }

    #[test]
    fn fault_response_is_connection_lost_error() {
        let xml = r#"<methodResponse><fault><value><struct>
<member><name>faultString</name><value><string>no such build</string></value></member>
</struct></value></fault></methodResponse>"#;
        let err = decode_get_build_response(xml).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionLost);
    }

    #[tokio::test]
    async fn http_client_retries_then_succeeds() {
        let server = MockServer::start().await;
        let ok_body = r#"<methodResponse><params><param><value><struct>
<member><name>nvr</name><value><string>foo-1-1</string></value></member>
</struct></value></param></params></methodResponse>"#;

        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ok_body))
            .mount(&server)
            .await;

        let mut client = HttpBuildsysClient::new(server.uri()).unwrap();
        client.retry_config = RetryConfig {
            max_retries: 3,
            factor: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
        };

        let info = client.get_build(42).await.unwrap();
        assert_eq!(info.raw["nvr"], json!("foo-1-1"));
    }

    #[tokio::test]
    async fn mock_client_returns_registered_response() {
        let mock = MockBuildsysClient::new().with_response(7, json!({"nvr": "bar-2-2"}));
        let info = mock.get_build(7).await.unwrap();
        assert_eq!(info.raw["nvr"], json!("bar-2-2"));
        assert!(mock.get_build(99).await.is_err());
    }
}
