use lunet_core::Value;
use thiserror::Error;

/// Env var that flips the default for TLS verification.
pub const INSECURE_ENV: &str = "LUNET_HTTPC_INSECURE";

#[derive(Clone, Debug, Error, PartialEq)]
pub enum HttpcError {
    #[error("BAD_PARAM: {0}")]
    BadParam(String),
    #[error("BAD_SCHEME: {0}")]
    BadScheme(String),
    #[error("LIMIT_EXCEEDED:{0}")]
    LimitExceeded(&'static str),
    #[error("LOW_SPEED")]
    LowSpeed,
    #[error("CONNECT_FAILED: {0}")]
    ConnectFailed(String),
    #[error("READ_FAILED: {0}")]
    ReadFailed(String),
}

/// Options for one outbound request. Every limit has a conservative
/// default; `validate` runs before any network activity.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout_ms: u64,
    /// Must not exceed `timeout_ms`; rejected at parse time otherwise.
    pub connect_timeout_ms: u64,
    pub max_body_bytes: u64,
    pub max_header_bytes: usize,
    pub max_header_lines: usize,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    /// Low-speed watchdog: abort when fewer than this many bytes arrive
    /// over any `low_speed_window_ms` span. 0 disables.
    pub low_speed_bytes: u64,
    pub low_speed_window_ms: u64,
    pub insecure: bool,
    /// Permit `file://` URLs (off by default; the scheme gate allows
    /// only http/https otherwise).
    pub allow_file: bool,
}

fn env_truthy(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

impl RequestOptions {
    pub fn new(url: impl Into<String>) -> RequestOptions {
        let timeout_ms = 30_000;
        RequestOptions {
            url: url.into(),
            method: "GET".to_string(),
            headers: Vec::new(),
            body: None,
            timeout_ms,
            connect_timeout_ms: 10_000.min(timeout_ms),
            max_body_bytes: 8 * 1024 * 1024,
            max_header_bytes: 64 * 1024,
            max_header_lines: 128,
            follow_redirects: true,
            max_redirects: 5,
            low_speed_bytes: 0,
            low_speed_window_ms: 10_000,
            insecure: env_truthy(INSECURE_ENV),
            allow_file: false,
        }
    }

    /// Parse a script options table: `{url, method?, headers?, body?,
    /// timeout_ms?, …}`. Headers accept a string-keyed map or an array of
    /// `{name, value}` pairs.
    pub fn from_value(v: &Value) -> Result<RequestOptions, HttpcError> {
        let t = match v {
            Value::Str(url) => return Ok(RequestOptions::new(url.clone())),
            Value::Table(t) => t,
            other => {
                return Err(HttpcError::BadParam(format!(
                    "options must be a table, got {}",
                    other.type_name()
                )))
            }
        };
        let url = t
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HttpcError::BadParam("missing url".into()))?;
        let mut opts = RequestOptions::new(url);

        if let Some(m) = t.get("method").and_then(|v| v.as_str()) {
            opts.method = m.to_ascii_uppercase();
        }
        if let Some(b) = t.get("body") {
            opts.body = match b {
                Value::Str(s) => Some(s.clone().into_bytes()),
                Value::Bytes(b) => Some(b.to_vec()),
                Value::Nil => None,
                other => {
                    return Err(HttpcError::BadParam(format!(
                        "body must be string or bytes, got {}",
                        other.type_name()
                    )))
                }
            };
        }
        if let Some(h) = t.get("headers") {
            opts.headers = parse_headers(h)?;
        }

        macro_rules! int_field {
            ($name:literal, $slot:expr) => {
                if let Some(n) = t.get($name).and_then(|v| v.as_int()) {
                    if n < 0 {
                        return Err(HttpcError::BadParam(concat!($name, " must be >= 0").into()));
                    }
                    $slot = n as _;
                }
            };
        }
        int_field!("timeout_ms", opts.timeout_ms);
        // Track the total unless an explicit connect timeout follows.
        opts.connect_timeout_ms = opts.connect_timeout_ms.min(opts.timeout_ms);
        int_field!("connect_timeout_ms", opts.connect_timeout_ms);
        int_field!("max_body_bytes", opts.max_body_bytes);
        int_field!("max_header_bytes", opts.max_header_bytes);
        int_field!("max_header_lines", opts.max_header_lines);
        int_field!("max_redirects", opts.max_redirects);
        int_field!("low_speed_bytes", opts.low_speed_bytes);
        int_field!("low_speed_window_ms", opts.low_speed_window_ms);

        if let Some(Value::Bool(b)) = t.get("follow_redirects") {
            opts.follow_redirects = *b;
        }
        if let Some(Value::Bool(b)) = t.get("insecure") {
            opts.insecure = *b;
        }
        if let Some(Value::Bool(b)) = t.get("allow_file") {
            opts.allow_file = *b;
        }

        opts.validate()?;
        Ok(opts)
    }

    pub fn scheme(&self) -> &str {
        self.url.split("://").next().unwrap_or("")
    }

    /// Parse-time validation: scheme gate and timeout consistency.
    pub fn validate(&self) -> Result<(), HttpcError> {
        match self.scheme() {
            "http" | "https" => {}
            "file" if self.allow_file => {}
            s => return Err(HttpcError::BadScheme(s.to_string())),
        }
        if self.connect_timeout_ms > self.timeout_ms {
            return Err(HttpcError::BadParam(
                "connect_timeout_ms > timeout_ms".into(),
            ));
        }
        Ok(())
    }
}

fn parse_headers(v: &Value) -> Result<Vec<(String, String)>, HttpcError> {
    let t = match v {
        Value::Table(t) => t,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(HttpcError::BadParam(format!(
                "headers must be a table, got {}",
                other.type_name()
            )))
        }
    };
    let mut out = Vec::new();
    // Map part: name → value.
    for (k, v) in &t.map {
        let value = v
            .coerce_str()
            .ok_or_else(|| HttpcError::BadParam(format!("header {k} is not a string")))?;
        out.push((k.clone(), value));
    }
    // Array part: {name, value} pairs.
    for pair in &t.arr {
        let pair = pair
            .as_table()
            .ok_or_else(|| HttpcError::BadParam("header pair must be a table".into()))?;
        let name = pair
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HttpcError::BadParam("header pair missing name".into()))?;
        let value = pair
            .get("value")
            .and_then(|v| v.coerce_str())
            .ok_or_else(|| HttpcError::BadParam("header pair missing value".into()))?;
        out.push((name.to_string(), value));
    }
    Ok(out)
}
