//! Outbound HTTPS client for the lunet runtime.
//!
//! One-shot blocking HTTP requests hosted on the thread pool. The limits
//! (`max_body_bytes`, header caps, the low-speed watchdog) are enforced
//! inside the delivery path — the body is streamed chunk by chunk and the
//! transfer aborts the moment a cap is crossed, because some overruns are
//! only detectable mid-stream. Results come back to the fiber as a
//! `{status, body, headers, effective_url}` table or `(nil, err)`.

mod options;
mod worker;

pub use options::{HttpcError, RequestOptions};
pub use worker::HttpResponse;

use async_trait::async_trait;
use lunet_core::{NativeOp, OpRequest, RuntimeHandle, Table, Value};

/// Build the script-visible `request(opts)` operation.
pub fn request(opts: RequestOptions) -> OpRequest {
    OpRequest::Native(Box::new(RequestOp { opts }))
}

/// Parse an options table and build the operation. Validation failures
/// (bad scheme, inconsistent timeouts) are reported at parse time.
pub fn request_value(v: &Value) -> Result<OpRequest, HttpcError> {
    Ok(request(RequestOptions::from_value(v)?))
}

struct RequestOp {
    opts: RequestOptions,
}

#[async_trait(?Send)]
impl NativeOp for RequestOp {
    fn name(&self) -> &'static str {
        "http_request"
    }

    async fn run(self: Box<Self>, _rt: RuntimeHandle) -> Vec<Value> {
        let opts = self.opts;
        if let Err(e) = opts.validate() {
            return vec![Value::Nil, Value::Str(e.to_string())];
        }
        let joined = tokio::task::spawn_blocking(move || worker::perform(&opts)).await;
        match joined {
            Ok(Ok(resp)) => vec![materialize(resp), Value::Nil],
            Ok(Err(e)) => vec![Value::Nil, Value::Str(e.to_string())],
            Err(e) => {
                tracing::error!("http worker panicked: {e}");
                vec![Value::Nil, Value::Str(format!("http worker failed: {e}"))]
            }
        }
    }
}

fn materialize(resp: HttpResponse) -> Value {
    let mut t = Table::new();
    t.set("status", Value::Int(i64::from(resp.status)));
    t.set("body", Value::Bytes(resp.body.into()));
    let mut headers = Table::new();
    for (name, value) in resp.headers {
        let mut h = Table::new();
        h.set("name", Value::Str(name));
        h.set("value", Value::Str(value));
        headers.push(Value::Table(h));
    }
    t.set("headers", Value::Table(headers));
    t.set("effective_url", Value::Str(resp.effective_url));
    Value::Table(t)
}
