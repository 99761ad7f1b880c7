//! RPC batch encoding and stream framing.
//!
//! Batches are JSON: a single item encodes as an object, several as an
//! array. On a stream each encoded batch is prefixed with its length as a
//! 4-byte big-endian integer.

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{error_code, ErrorObject, Params, RpcRequest, RpcResponse};
use crate::{Result, RpcError};

const VERSION: &str = "2.0";
const USER_AGENT_KEY: &str = "user-agent";

/// Why an item in a received batch was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// The payload was not valid JSON.
    Parse,
    /// Valid JSON that is neither a request nor a response.
    InvalidRequest,
}

/// A rejected batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub id: Option<u64>,
    pub kind: DecodeErrorKind,
    pub reason: String,
}

impl DecodeError {
    // ---

    fn parse(reason: impl Into<String>) -> Self {
        Self {
            id: None,
            kind: DecodeErrorKind::Parse,
            reason: reason.into(),
        }
    }

    fn invalid(id: Option<u64>, reason: impl Into<String>) -> Self {
        Self {
            id,
            kind: DecodeErrorKind::InvalidRequest,
            reason: reason.into(),
        }
    }

    /// Error response a server sends back for this item.
    pub fn to_response(&self) -> RpcResponse {
        let code = match self.kind {
            DecodeErrorKind::Parse => error_code::PARSE_ERROR,
            DecodeErrorKind::InvalidRequest => error_code::INVALID_REQUEST,
        };
        RpcResponse::error(self.id, ErrorObject::new(code, self.reason.clone()))
    }
}

impl From<DecodeError> for RpcError {
    fn from(err: DecodeError) -> Self {
        RpcError::InvalidPacket(err.reason)
    }
}

/// Everything found in one received batch.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub requests: Vec<RpcRequest>,
    pub responses: Vec<RpcResponse>,
    pub errors: Vec<DecodeError>,
}

/// Encode requests and responses into one batch.
///
/// # Errors
///
/// Returns [`RpcError::Serialization`] if JSON encoding fails.
pub fn encode(requests: &[RpcRequest], responses: &[RpcResponse]) -> Result<Bytes> {
    // ---
    let mut items: Vec<Value> = requests
        .iter()
        .map(request_to_value)
        .chain(responses.iter().map(response_to_value))
        .collect();

    let doc = if items.len() == 1 {
        items.remove(0)
    } else {
        Value::Array(items)
    };

    Ok(Bytes::from(serde_json::to_vec(&doc)?))
}

/// Decode a received batch.
///
/// Never fails: malformed input shows up in [`DecodedBatch::errors`].
pub fn decode(data: &[u8]) -> DecodedBatch {
    // ---
    let mut batch = DecodedBatch::default();

    let doc: Value = match serde_json::from_slice(data) {
        Ok(doc) => doc,
        Err(e) => {
            batch.errors.push(DecodeError::parse(e.to_string()));
            return batch;
        }
    };

    let items = match doc {
        Value::Array(items) if items.is_empty() => {
            batch.errors.push(DecodeError::invalid(None, "empty batch"));
            return batch;
        }
        Value::Array(items) => items,
        item @ Value::Object(_) => vec![item],
        _ => {
            batch.errors.push(DecodeError::invalid(None, "expected object or array"));
            return batch;
        }
    };

    for item in items {
        match classify(item) {
            Ok(Item::Request(req)) => batch.requests.push(req),
            Ok(Item::Response(resp)) => batch.responses.push(resp),
            Err(err) => batch.errors.push(err),
        }
    }

    batch
}

/// Encode the connection hello carrying the client's user-agent.
pub fn encode_hello(user_agent: &str) -> Result<Bytes> {
    let doc = json!({ USER_AGENT_KEY: user_agent });
    Ok(Bytes::from(serde_json::to_vec(&doc)?))
}

/// Extract the user-agent if `data` is a connection hello.
pub fn decode_hello(data: &[u8]) -> Option<String> {
    // ---
    let doc: Value = serde_json::from_slice(data).ok()?;
    let obj = doc.as_object()?;
    if obj.contains_key("method") {
        return None;
    }
    obj.get(USER_AGENT_KEY)?.as_str().map(str::to_string)
}

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Returns [`RpcError::InvalidPacket`] if the payload does not fit the
/// 32-bit length prefix, or the underlying I/O error.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // ---
    let len = u32::try_from(payload.len())
        .map_err(|_| RpcError::InvalidPacket(format!("frame too large: {}", payload.len())))?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
///
/// # Errors
///
/// Returns [`RpcError::InvalidPacket`] for frames larger than `max_len`, or
/// the underlying I/O error (including an EOF in the middle of a frame).
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    // ---
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(RpcError::InvalidPacket(format!(
            "frame of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

enum Item {
    Request(RpcRequest),
    Response(RpcResponse),
}

fn request_to_value(req: &RpcRequest) -> Value {
    // ---
    let mut obj = Map::new();
    obj.insert("jsonrpc".into(), VERSION.into());
    if let Some(id) = req.id() {
        obj.insert("id".into(), id.into());
    }
    obj.insert("method".into(), req.method().into());
    obj.insert("args".into(), Value::Array(req.params().args().to_vec()));
    if !req.params().kwargs().is_empty() {
        obj.insert("kwargs".into(), Value::Object(req.params().kwargs().clone()));
    }
    Value::Object(obj)
}

fn response_to_value(resp: &RpcResponse) -> Value {
    // ---
    let id = resp.id.map_or(Value::Null, Value::from);
    match &resp.outcome {
        Ok(result) => json!({ "jsonrpc": VERSION, "id": id, "result": result }),
        Err(err) => json!({
            "jsonrpc": VERSION,
            "id": id,
            "error": { "code": err.code, "message": err.message },
        }),
    }
}

/// Read an id member; `Ok(None)` for absent, null or zero.
fn parse_id(obj: &Map<String, Value>) -> std::result::Result<Option<u64>, DecodeError> {
    match obj.get("id") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(0) => Ok(None),
            Some(id) => Ok(Some(id)),
            None => Err(DecodeError::invalid(None, format!("invalid id: {v}"))),
        },
    }
}

fn classify(item: Value) -> std::result::Result<Item, DecodeError> {
    // ---
    let Value::Object(mut obj) = item else {
        return Err(DecodeError::invalid(None, "batch item is not an object"));
    };

    let id = parse_id(&obj)?;

    if let Some(method) = obj.remove("method") {
        let Value::String(method) = method else {
            return Err(DecodeError::invalid(id, "method is not a string"));
        };

        let mut args = match obj.remove("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(args)) => args,
            Some(_) => return Err(DecodeError::invalid(id, "args is not an array")),
        };
        let mut kwargs = match obj.remove("kwargs") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(kwargs)) => kwargs,
            Some(_) => return Err(DecodeError::invalid(id, "kwargs is not an object")),
        };

        // Plain JSON-RPC peers send `params` as either list or mapping
        match obj.remove("params") {
            None | Some(Value::Null) => {}
            Some(Value::Array(more)) => args.extend(more),
            Some(Value::Object(more)) => kwargs.extend(more),
            Some(_) => return Err(DecodeError::invalid(id, "params is not a list or mapping")),
        }

        let params = Params::from_parts(args, kwargs);
        let req = match id {
            Some(id) => RpcRequest::new(id, method, params),
            None => RpcRequest::notification(method, params),
        };
        return Ok(Item::Request(req));
    }

    if let Some(error) = obj.remove("error") {
        let code = error.get("code").and_then(Value::as_i64);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return match code {
            Some(code) => Ok(Item::Response(RpcResponse::error(
                id,
                ErrorObject::new(code, message),
            ))),
            None => Err(DecodeError::invalid(id, "error member without code")),
        };
    }

    if let Some(result) = obj.remove("result") {
        return match id {
            Some(id) => Ok(Item::Response(RpcResponse::result(id, result))),
            None => Err(DecodeError::invalid(None, "result without id")),
        };
    }

    Err(DecodeError::invalid(id, "neither request nor response"))
}
