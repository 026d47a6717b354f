//! JSON-RPC over HTTP
//!
//! Every call goes through [`RpcClient::call`], which owns the retry policy:
//!
//! * rate limiting (HTTP 429) waits as long as the node asks, and doesn't
//!   count as a failed attempt,
//! * timeouts, connection errors, 5xx and garbled bodies are retried with
//!   backoff until the attempt budget runs out,
//! * "height out of range" and anything that would fail the same way again
//!   (auth, bad request, unknown method, result we can't decode) fail right away.
use super::{BlockSource, RpcAuth, RpcError};
use crate::{
    prelude::*,
    util::{display_chain, trace_time, RetryPolicy},
    BlockHeader, BlockStats,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// Bitcoin Core `RPC_INVALID_PARAMETER`
const RPC_INVALID_PARAMETER: i64 = -8;
const RPC_INVALID_REQUEST: i64 = -32600;
const RPC_METHOD_NOT_FOUND: i64 = -32601;
const RPC_INVALID_PARAMS: i64 = -32602;
/// Used by some hosted node providers for throttling
const RPC_LIMIT_EXCEEDED: i64 = -32005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcClientOptions {
    /// Whole-request timeout
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Total time a single call may spend waiting out rate limits
    pub rate_limit_max_wait: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(30)),
            rate_limit_max_wait: Duration::from_secs(300),
        }
    }
}

/// How one HTTP round-trip went
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Attempt {
    Transient(String),
    RateLimited(Option<Duration>),
    OutOfRange(String),
    Permanent(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

pub(crate) fn classify_rpc_error(code: i64, message: &str) -> Attempt {
    let described = format!("RPC error {}: {}", code, message);
    match code {
        RPC_INVALID_PARAMETER => {
            let lower = message.to_lowercase();
            if lower.contains("out of range") || lower.contains("after current tip") {
                Attempt::OutOfRange(described)
            } else {
                Attempt::Permanent(described)
            }
        }
        RPC_INVALID_REQUEST | RPC_METHOD_NOT_FOUND | RPC_INVALID_PARAMS => {
            Attempt::Permanent(described)
        }
        429 | RPC_LIMIT_EXCEEDED => Attempt::RateLimited(None),
        // -28 (warming up), -5 (block not found mid-reorg), internal errors...
        _ => Attempt::Transient(described),
    }
}

/// Decide what a response means, without doing any I/O
///
/// Bitcoin Core answers JSON-RPC 1.0 errors with HTTP 404/500, so the body is
/// looked at before the status code.
pub(crate) fn classify_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> Result<Value, Attempt> {
    match status {
        429 => return Err(Attempt::RateLimited(retry_after)),
        401 | 403 => {
            return Err(Attempt::Permanent(format!(
                "HTTP {}: credentials rejected",
                status
            )))
        }
        _ => {}
    }

    match serde_json::from_str::<Envelope>(body) {
        Ok(Envelope {
            error: Some(error), ..
        }) => Err(classify_rpc_error(error.code, &error.message)),
        Ok(Envelope {
            result: Some(value),
            ..
        }) if (200..300).contains(&status) => Ok(value),
        _ => {
            let snippet: String = body.chars().take(256).collect();
            match status {
                200..=299 => Err(Attempt::Transient(format!(
                    "malformed response body: {}",
                    snippet
                ))),
                408 | 500..=599 => Err(Attempt::Transient(format!("HTTP {}", status))),
                _ => Err(Attempt::Permanent(format!("HTTP {}: {}", status, snippet))),
            }
        }
    }
}

/// Only the delay-seconds form; HTTP dates fall back to our own backoff
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub struct RpcClient {
    http: reqwest::blocking::Client,
    url: String,
    auth: RpcAuth,
    opts: RpcClientOptions,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: String, auth: RpcAuth, opts: RpcClientOptions) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(opts.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            url,
            auth,
            opts,
            next_id: AtomicU64::new(1),
        })
    }

    fn attempt(&self, method: &str, params: &[Value]) -> Result<Value, Attempt> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let req = self.http.post(&self.url).json(&body);
        let req = match &self.auth {
            RpcAuth::None => req,
            RpcAuth::Basic { user, pass } => req.basic_auth(user, Some(pass)),
            RpcAuth::Bearer(token) => req.bearer_auth(token),
        };

        let resp = req.send().map_err(|e| {
            Attempt::Transient(if e.is_timeout() {
                format!("timed out after {:?}", self.opts.timeout)
            } else {
                display_chain(&e)
            })
        })?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = resp
            .text()
            .map_err(|e| Attempt::Transient(format!("reading body: {}", display_chain(&e))))?;

        classify_response(status, retry_after, &text)
    }

    /// Run one RPC to completion
    ///
    /// `height` is what an "out of range" answer refers to; calls that aren't
    /// about a height treat it as permanent.
    pub fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[Value],
        height: Option<BlockHeight>,
    ) -> Result<T, RpcError> {
        let mut failures = 0;
        // back-to-back rate limits without a hint back off exponentially
        let mut rate_limit_streak = 0;
        let mut rate_limited_for = Duration::ZERO;

        loop {
            let res = trace_time(
                || self.attempt(method, params),
                |duration, _| trace!("RPC {} took {}ms", method, duration.as_millis()),
            );

            match res {
                Ok(value) => {
                    return serde_json::from_value(value).map_err(|e| {
                        RpcError::Permanent(format!("{}: undecodable result: {}", method, e))
                    })
                }
                Err(Attempt::OutOfRange(msg)) => {
                    return Err(match height {
                        Some(h) => RpcError::HeightNotYetMined(h),
                        None => RpcError::Permanent(format!("{}: {}", method, msg)),
                    })
                }
                Err(Attempt::Permanent(msg)) => {
                    return Err(RpcError::Permanent(format!("{}: {}", method, msg)))
                }
                Err(Attempt::RateLimited(hint)) => {
                    rate_limit_streak += 1;
                    let wait = hint.unwrap_or_else(|| self.opts.retry.delay(rate_limit_streak));
                    rate_limited_for += wait;
                    if rate_limited_for > self.opts.rate_limit_max_wait {
                        return Err(RpcError::Unavailable {
                            attempts: failures,
                            last: format!(
                                "{}: still rate limited after waiting {:?}",
                                method,
                                rate_limited_for - wait
                            ),
                        });
                    }
                    warn!("RPC {} rate limited; waiting {:?}", method, wait);
                    std::thread::sleep(wait);
                }
                Err(Attempt::Transient(msg)) => {
                    rate_limit_streak = 0;
                    failures += 1;
                    if failures >= self.opts.retry.max_attempts {
                        return Err(RpcError::Unavailable {
                            attempts: failures,
                            last: format!("{}: {}", method, msg),
                        });
                    }
                    let delay = self.opts.retry.delay(failures);
                    warn!(
                        "RPC {} failed (attempt {}/{}): {}; retrying in {:?}",
                        method, failures, self.opts.retry.max_attempts, msg, delay
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}

impl BlockSource for RpcClient {
    fn fetch_tip_height(&self) -> Result<BlockHeight, RpcError> {
        let count: u64 = self.call("getblockcount", &[], None)?;
        BlockHeight::try_from(count)
            .map_err(|_| RpcError::Permanent(format!("getblockcount: {} out of bounds", count)))
    }

    fn fetch_hash(&self, height: BlockHeight) -> Result<BlockHash, RpcError> {
        self.call("getblockhash", &[json!(height)], Some(height))
    }

    fn fetch_header(&self, height: BlockHeight) -> Result<BlockHeader, RpcError> {
        let hash = self.fetch_hash(height)?;
        self.fetch_header_of(height, &hash)
    }

    fn fetch_header_of(
        &self,
        height: BlockHeight,
        hash: &BlockHash,
    ) -> Result<BlockHeader, RpcError> {
        self.call(
            "getblockheader",
            &[json!(hash.to_string()), json!(true)],
            Some(height),
        )
    }

    fn fetch_stats(&self, height: BlockHeight) -> Result<BlockStats, RpcError> {
        self.call("getblockstats", &[json!(height)], Some(height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread::JoinHandle,
    };

    #[test]
    fn classifies_out_of_range() {
        let body = r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#;
        assert!(matches!(
            classify_response(500, None, body),
            Err(Attempt::OutOfRange(_))
        ));
        let body = r#"{"result":null,"error":{"code":-8,"message":"Target block height 900 after current tip 800"},"id":1}"#;
        assert!(matches!(
            classify_response(200, None, body),
            Err(Attempt::OutOfRange(_))
        ));
        let body = r#"{"result":null,"error":{"code":-8,"message":"blockhash must be of length 64"},"id":1}"#;
        assert!(matches!(
            classify_response(500, None, body),
            Err(Attempt::Permanent(_))
        ));
    }

    #[test]
    fn classifies_permanent_failures() {
        for code in [-32600, -32601, -32602] {
            let body = format!(
                r#"{{"result":null,"error":{{"code":{},"message":"nope"}},"id":1}}"#,
                code
            );
            assert!(
                matches!(classify_response(404, None, &body), Err(Attempt::Permanent(_))),
                "code {}",
                code
            );
        }
        assert!(matches!(
            classify_response(401, None, ""),
            Err(Attempt::Permanent(_))
        ));
        assert!(matches!(
            classify_response(403, None, "Forbidden"),
            Err(Attempt::Permanent(_))
        ));
        assert!(matches!(
            classify_response(400, None, "<html>bad request</html>"),
            Err(Attempt::Permanent(_))
        ));
    }

    #[test]
    fn classifies_transient_failures() {
        let warming_up = r#"{"result":null,"error":{"code":-28,"message":"Loading block index..."},"id":1}"#;
        assert!(matches!(
            classify_response(500, None, warming_up),
            Err(Attempt::Transient(_))
        ));
        assert!(matches!(
            classify_response(502, None, "Bad Gateway"),
            Err(Attempt::Transient(_))
        ));
        assert!(matches!(
            classify_response(200, None, "{\"resu"),
            Err(Attempt::Transient(_))
        ));
    }

    #[test]
    fn classifies_rate_limiting() {
        assert_eq!(
            classify_response(429, Some(Duration::from_secs(7)), ""),
            Err(Attempt::RateLimited(Some(Duration::from_secs(7))))
        );
        let body = r#"{"jsonrpc":"2.0","error":{"code":-32005,"message":"limit exceeded"},"id":1}"#;
        assert_eq!(
            classify_response(200, None, body),
            Err(Attempt::RateLimited(None))
        );
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn passes_results_through() {
        assert_eq!(
            classify_response(200, None, r#"{"result":812345,"error":null,"id":3}"#),
            Ok(json!(812345))
        );
    }

    struct Canned {
        status: u16,
        headers: &'static str,
        body: &'static str,
    }

    const fn canned(status: u16, headers: &'static str, body: &'static str) -> Canned {
        Canned {
            status,
            headers,
            body,
        }
    }

    fn read_request(stream: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let content_length = text[..end]
                    .lines()
                    .filter_map(|l| l.split_once(':'))
                    .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                    .map(|(_, v)| v.trim().parse::<usize>().unwrap())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + content_length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Serve `script` one response per connection; returns the requests seen
    fn serve(script: Vec<Canned>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut requests = vec![];
            for resp in script {
                let (mut stream, _) = listener.accept().unwrap();
                requests.push(read_request(&mut stream));
                let raw = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n{}",
                    resp.status,
                    resp.body.len(),
                    resp.headers,
                    resp.body
                );
                stream.write_all(raw.as_bytes()).unwrap();
            }
            requests
        });
        (url, handle)
    }

    fn client(url: String, auth: RpcAuth, max_attempts: u32) -> RpcClient {
        RpcClient::new(
            url,
            auth,
            RpcClientOptions {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy::immediate(max_attempts),
                rate_limit_max_wait: Duration::from_secs(5),
            },
        )
        .unwrap()
    }

    #[test]
    fn rate_limit_is_not_a_failed_attempt() {
        let (url, server) = serve(vec![
            canned(429, "Retry-After: 0\r\n", ""),
            canned(503, "", ""),
            canned(200, "", r#"{"result":3,"error":null,"id":3}"#),
        ]);
        let rpc = client(url, RpcAuth::Bearer("tok".into()), 2);

        assert_eq!(rpc.fetch_tip_height(), Ok(3));

        let requests = server.join().unwrap();
        assert_eq!(requests.len(), 3);
        for req in &requests {
            let req = req.to_lowercase();
            assert!(req.contains("authorization: bearer tok"));
            assert!(req.contains(r#""method":"getblockcount""#));
        }
    }

    #[test]
    fn rate_limit_waits_grow_without_retry_after() {
        let (url, server) = serve(vec![
            canned(429, "", ""),
            canned(429, "", ""),
            canned(429, "", ""),
        ]);
        // waits of 10, 20 and 40ms; the third would exceed the 50ms budget
        let rpc = RpcClient::new(
            url,
            RpcAuth::None,
            RpcClientOptions {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy::new(5, Duration::from_millis(10), Duration::from_secs(1)),
                rate_limit_max_wait: Duration::from_millis(50),
            },
        )
        .unwrap();

        match rpc.fetch_tip_height() {
            Err(RpcError::Unavailable { last, .. }) => {
                assert!(last.contains("still rate limited after waiting 30ms"), "{}", last)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(server.join().unwrap().len(), 3);
    }

    #[test]
    fn out_of_range_is_not_retried() {
        let (url, server) = serve(vec![canned(
            500,
            "",
            r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#,
        )]);
        let rpc = client(url, RpcAuth::None, 5);

        assert_eq!(rpc.fetch_hash(900), Err(RpcError::HeightNotYetMined(900)));
        assert_eq!(server.join().unwrap().len(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (url, server) = serve(vec![
            canned(503, "", ""),
            canned(503, "", ""),
            canned(503, "", ""),
        ]);
        let rpc = client(url, RpcAuth::None, 3);

        match rpc.fetch_stats(10) {
            Err(RpcError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(server.join().unwrap().len(), 3);
    }

    #[test]
    fn undecodable_result_is_permanent() {
        let (url, server) = serve(vec![canned(
            200,
            "",
            r#"{"result":"not a hash","error":null,"id":1}"#,
        )]);
        let rpc = client(url, RpcAuth::None, 5);

        assert!(matches!(rpc.fetch_hash(1), Err(RpcError::Permanent(_))));
        assert_eq!(server.join().unwrap().len(), 1);
    }
}
