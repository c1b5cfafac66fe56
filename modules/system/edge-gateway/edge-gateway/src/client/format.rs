//! Standard JSON response envelope.
//!
//! Plain JSON objects are nested under `data` with a success code; objects
//! that already carry `code` and `reason` are treated as error payloads and
//! mapped field by field. Bodies larger than [`FORMAT_LIMIT`] are passed
//! through untouched.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HeaderValue};
use http::Response;
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::body::{ResponseBody, full};
use crate::error::{BoxError, GatewayError};

/// Upstream header carrying the trace id copied into the envelope.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Largest body buffered for formatting.
pub const FORMAT_LIMIT: usize = 64 * 1024;

const SUCCESS_CODE: i64 = 200;
const SUCCESS_MESSAGE: &str = "success";

#[derive(Debug, Serialize)]
struct Envelope {
    code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
    #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
}

impl Envelope {
    fn from_object(mut object: Map<String, Value>, trace_id: Option<String>) -> Self {
        if object.contains_key("code") && object.contains_key("reason") {
            let text = |v: Option<Value>| match v {
                Some(Value::String(s)) => Some(s),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            };
            return Self {
                code: object.get("code").and_then(Value::as_i64).unwrap_or_default(),
                reason: text(object.remove("reason")),
                data: object.remove("data").unwrap_or(Value::Null),
                message: text(object.remove("message")),
                metadata: object.remove("metadata").filter(|m| !m.is_null()),
                trace_id,
            };
        }
        Self {
            code: SUCCESS_CODE,
            reason: None,
            data: Value::Object(object),
            message: Some(SUCCESS_MESSAGE.to_owned()),
            metadata: None,
            trace_id,
        }
    }
}

/// Wrap `body` into the envelope; `None` when it is not a JSON object.
#[must_use]
pub fn envelope(body: &[u8], trace_id: Option<&str>) -> Option<Bytes> {
    let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) else {
        return None;
    };
    let wrapped = Envelope::from_object(object, trace_id.map(str::to_owned));
    serde_json::to_vec(&wrapped).ok().map(Bytes::from)
}

/// Buffer the upstream body and rewrite it through [`envelope`].
pub(crate) async fn format_response(
    response: Response<ResponseBody>,
) -> Result<Response<ResponseBody>, GatewayError> {
    let (mut parts, mut body) = response.into_parts();
    let mut buffered = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(GatewayError::Transport)?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        buffered.extend_from_slice(&data);
        if buffered.len() > FORMAT_LIMIT {
            let rest = Replay {
                head: Some(buffered.freeze()),
                rest: body,
            };
            return Ok(Response::from_parts(parts, rest.boxed()));
        }
    }
    let bytes = buffered.freeze();

    let trace_id = parts
        .headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let Some(formatted) = envelope(&bytes, trace_id) else {
        return Ok(Response::from_parts(parts, full(bytes)));
    };

    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(formatted.len()));
    Ok(Response::from_parts(parts, full(formatted)))
}

/// Already-read bytes followed by the unread remainder of a body.
struct Replay {
    head: Option<Bytes>,
    rest: ResponseBody,
}

impl Body for Replay {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        if let Some(head) = self.head.take() {
            return Poll::Ready(Some(Ok(Frame::data(head))));
        }
        Pin::new(&mut self.rest).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.head.is_none() && self.rest.is_end_stream()
    }
}
