use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::{RemoteErrorKind, RpcError};

/// JSON-RPC error codes used on the wire.
pub mod error_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_EXCEPTION: i64 = -32000;
}

/// Positional and named call arguments.
///
/// ```
/// use labwire::Params;
/// use serde_json::json;
///
/// let params = Params::new()
///     .arg(3)
///     .arg("volts")
///     .kwarg("channel", json!(2));
/// assert_eq!(params.args().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    // ---
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

impl Params {
    // ---

    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from already-decoded parts.
    pub fn from_parts(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a named argument; a repeated name replaces the earlier value.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Append any serializable value as a positional argument.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Serialization`] if `value` cannot be represented as JSON.
    pub fn serialize_arg<T: Serialize>(mut self, value: &T) -> crate::Result<Self> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }

    /// Look up an argument by position, falling back to its name.
    pub fn value(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    /// Deserialize an argument by position or name.
    ///
    /// # Errors
    ///
    /// Returns an invalid-params [`MethodError`] when the argument is missing
    /// or has the wrong shape.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, MethodError> {
        // ---
        let value = self
            .value(index, name)
            .ok_or_else(|| MethodError::invalid_params(format!("missing argument `{name}`")))?;

        serde_json::from_value(value.clone())
            .map_err(|e| MethodError::invalid_params(format!("argument `{name}`: {e}")))
    }

    /// Like [`get`](Self::get), but a missing argument yields `None`.
    pub fn get_opt<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, MethodError> {
        match self.value(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index, name).map(Some),
        }
    }
}

/// A single call or notification.
///
/// An id of `None` marks a notification: the server runs it but sends no
/// response. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    // ---
    id: Option<u64>,
    method: String,
    params: Params,
}

impl RpcRequest {
    // ---

    /// Build a request; an id of `0` is treated as a notification.
    pub fn new(id: u64, method: impl Into<String>, params: Params) -> Self {
        Self {
            id: (id != 0).then_some(id),
            method: method.into(),
            params,
        }
    }

    /// Build a fire-and-forget request.
    pub fn notification(method: impl Into<String>, params: Params) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Error member of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
}

impl ErrorObject {
    // ---

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_code::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// Encode a server-side exception as `"<Kind>|<message>"`.
    pub fn server_exception(kind: &RemoteErrorKind, message: &str) -> Self {
        Self::new(error_code::SERVER_EXCEPTION, format!("{}|{message}", kind.name()))
    }

    /// Convert into the client-side error for a call to `method`.
    pub fn into_rpc_error(self, method: &str) -> RpcError {
        // ---
        match self.code {
            error_code::METHOD_NOT_FOUND => RpcError::MethodNotFound(method.to_string()),
            error_code::INVALID_PARAMS => RpcError::InvalidParams(self.message),
            error_code::PARSE_ERROR | error_code::INVALID_REQUEST => {
                RpcError::InvalidPacket(self.message)
            }
            error_code::SERVER_EXCEPTION => {
                let (kind, message) = match self.message.split_once('|') {
                    Some((kind, message)) => (RemoteErrorKind::from_name(kind), message.to_string()),
                    None => (RemoteErrorKind::Runtime("RuntimeError".into()), self.message),
                };
                RpcError::ServerException { kind, message }
            }
            _ => RpcError::ServerException {
                kind: RemoteErrorKind::Runtime("InternalError".into()),
                message: self.message,
            },
        }
    }
}

/// Response to a request with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    // ---
    /// `None` only for errors about a request whose id could not be read.
    pub id: Option<u64>,
    pub outcome: std::result::Result<Value, ErrorObject>,
}

impl RpcResponse {
    // ---

    pub fn result(id: u64, value: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(value),
        }
    }

    pub fn error(id: Option<u64>, error: ErrorObject) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }
}

/// Failure reported by an exposed method.
///
/// The server converts it into an error response; it never reaches the
/// transport as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    // ---
    pub kind: MethodErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodErrorKind {
    /// Arguments did not match the method signature.
    InvalidParams,
    /// The method ran and failed with an error of this kind.
    Exception(RemoteErrorKind),
}

impl MethodError {
    // ---

    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: MethodErrorKind::Exception(kind),
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            kind: MethodErrorKind::InvalidParams,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidArgument, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Runtime("RuntimeError".into()), message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unsupported, message)
    }

    /// Wire representation of this failure.
    pub fn to_error_object(&self) -> ErrorObject {
        match &self.kind {
            MethodErrorKind::InvalidParams => {
                ErrorObject::new(error_code::INVALID_PARAMS, self.message.clone())
            }
            MethodErrorKind::Exception(kind) => ErrorObject::server_exception(kind, &self.message),
        }
    }
}

impl std::fmt::Display for MethodError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            MethodErrorKind::InvalidParams => write!(f, "invalid params: {}", self.message),
            MethodErrorKind::Exception(kind) => write!(f, "{kind}: {}", self.message),
        }
    }
}

impl std::error::Error for MethodError {}

impl From<serde_json::Error> for MethodError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(RemoteErrorKind::InvalidArgument, err.to_string())
    }
}

impl From<std::io::Error> for MethodError {
    fn from(err: std::io::Error) -> Self {
        Self::new(RemoteErrorKind::Io, err.to_string())
    }
}
