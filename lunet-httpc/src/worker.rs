use std::io::Read;
use std::time::{Duration, Instant};

use crate::options::{HttpcError, RequestOptions};

/// What the pool thread stages for the loop thread to materialize.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub effective_url: String,
}

/// Blocking request body. Runs on a pool thread; must not touch script
/// state. Limits are enforced while data is delivered, not merely passed
/// down as hints.
pub(crate) fn perform(opts: &RequestOptions) -> Result<HttpResponse, HttpcError> {
    if opts.scheme() == "file" {
        return perform_file(opts);
    }

    let redirect = if opts.follow_redirects {
        reqwest::redirect::Policy::limited(opts.max_redirects)
    } else {
        reqwest::redirect::Policy::none()
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(opts.timeout_ms))
        .connect_timeout(Duration::from_millis(opts.connect_timeout_ms))
        .redirect(redirect)
        .danger_accept_invalid_certs(opts.insecure)
        .build()
        .map_err(|e| HttpcError::ConnectFailed(e.to_string()))?;

    let method = reqwest::Method::from_bytes(opts.method.as_bytes())
        .map_err(|_| HttpcError::BadParam(format!("bad method: {}", opts.method)))?;
    let mut req = client.request(method, &opts.url);
    for (name, value) in &opts.headers {
        req = req.header(name, value);
    }
    if let Some(body) = &opts.body {
        req = req.body(body.clone());
    }

    let mut resp = req
        .send()
        .map_err(|e| HttpcError::ConnectFailed(e.to_string()))?;

    // Header caps, checked on receipt.
    if resp.headers().len() > opts.max_header_lines {
        return Err(HttpcError::LimitExceeded("max_header_lines"));
    }
    let header_bytes: usize = resp
        .headers()
        .iter()
        .map(|(n, v)| n.as_str().len() + v.as_bytes().len() + 4)
        .sum();
    if header_bytes > opts.max_header_bytes {
        return Err(HttpcError::LimitExceeded("max_header_bytes"));
    }

    let status = resp.status().as_u16();
    let effective_url = resp.url().to_string();
    let headers = resp
        .headers()
        .iter()
        .map(|(n, v)| {
            (
                n.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    // Stream the body so the cap aborts mid-transfer, and feed the
    // low-speed watchdog as chunks arrive.
    let mut body = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    let window = Duration::from_millis(opts.low_speed_window_ms.max(1));
    let mut window_start = Instant::now();
    let mut window_bytes: u64 = 0;
    loop {
        let n = resp
            .read(&mut chunk)
            .map_err(|e| HttpcError::ReadFailed(e.to_string()))?;
        if n == 0 {
            break;
        }
        if body.len() as u64 + n as u64 > opts.max_body_bytes {
            return Err(HttpcError::LimitExceeded("max_body_bytes"));
        }
        body.extend_from_slice(&chunk[..n]);

        if opts.low_speed_bytes > 0 {
            window_bytes += n as u64;
            if window_start.elapsed() >= window {
                if window_bytes < opts.low_speed_bytes {
                    return Err(HttpcError::LowSpeed);
                }
                window_start = Instant::now();
                window_bytes = 0;
            }
        }
    }

    Ok(HttpResponse {
        status,
        body,
        headers,
        effective_url,
    })
}

/// `file://` delivery, gated behind `allow_file`. Same body cap as the
/// network path.
fn perform_file(opts: &RequestOptions) -> Result<HttpResponse, HttpcError> {
    let path = opts.url.trim_start_matches("file://");
    let meta =
        std::fs::metadata(path).map_err(|e| HttpcError::ReadFailed(e.to_string()))?;
    if meta.len() > opts.max_body_bytes {
        return Err(HttpcError::LimitExceeded("max_body_bytes"));
    }
    let body = std::fs::read(path).map_err(|e| HttpcError::ReadFailed(e.to_string()))?;
    Ok(HttpResponse {
        status: 200,
        body,
        headers: Vec::new(),
        effective_url: opts.url.clone(),
    })
}
