//! Readiness checks
//!
//! Every process generation gets a fresh [`ReadyContext`] carrying the live
//! output of that process. A readiness predicate is any async function of
//! the context; the helpers here cover the usual cases (a log line shows up,
//! a TCP port starts accepting, an HTTP endpoint answers with the expected
//! status, a fixed delay passes).

use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::service::BoxError;

/// Interval between TCP connection and HTTP request attempts
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Status [`once_http_ok`] waits for unless told otherwise
pub const HTTP_OK: u16 = 200;

/// Upper bound on a single HTTP readiness request
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Live, line-by-line view of one process's combined output
pub struct OutputLines {
    rx: mpsc::UnboundedReceiver<String>,
}

impl OutputLines {
    /// Create a connected sender/view pair
    pub fn channel() -> (mpsc::UnboundedSender<String>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next output line, or `None` once the process output has ended
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Argument passed to a readiness predicate
pub struct ReadyContext {
    pub service_id: String,
    pub output: OutputLines,
}

impl ReadyContext {
    pub fn new(service_id: impl Into<String>, output: OutputLines) -> Self {
        Self {
            service_id: service_id.into(),
            output,
        }
    }

    /// Wait for an output line that passes `test`
    ///
    /// If the output ends first this never resolves; the caller sees the
    /// process exit instead.
    pub async fn once_output_line<F>(&mut self, mut test: F) -> Result<(), BoxError>
    where
        F: FnMut(&str) -> bool,
    {
        while let Some(line) = self.output.next_line().await {
            if test(&line) {
                return Ok(());
            }
        }
        std::future::pending().await
    }

    /// Wait for an output line equal to `text`
    pub async fn once_output_line_is(&mut self, text: &str) -> Result<(), BoxError> {
        self.once_output_line(|line| line == text).await
    }

    /// Wait for an output line containing `text`
    pub async fn once_output_line_includes(&mut self, text: &str) -> Result<(), BoxError> {
        self.once_output_line(|line| line.contains(text)).await
    }

    /// Wait until `host:port` accepts TCP connections
    pub async fn once_tcp_port_used(&self, port: u16, host: &str) -> Result<(), BoxError> {
        once_tcp_port_used(port, host).await
    }

    /// Wait until a GET of `url` answers with `expected_status`
    pub async fn once_http_ok(&self, url: &str, expected_status: u16) -> Result<(), BoxError> {
        once_http_ok(url, expected_status).await
    }

    /// Wait a fixed amount of time
    pub async fn once_delay(&self, delay: Duration) -> Result<(), BoxError> {
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Run `test` until it returns `true`, at most once per `interval`
pub async fn once_async_test<F, Fut>(interval: Duration, mut test: F) -> Result<(), BoxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BoxError>>,
{
    loop {
        let delay = tokio::time::sleep(interval);
        if test().await? {
            return Ok(());
        }
        delay.await;
    }
}

/// Wait until `host:port` accepts TCP connections
///
/// Refused and timed out connections count as "not yet"; any other error
/// fails the check.
pub async fn once_tcp_port_used(port: u16, host: &str) -> Result<(), BoxError> {
    once_async_test(POLL_INTERVAL, || async move {
        match TcpStream::connect((host, port)).await {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    })
    .await
}

/// Wait until a GET of `url` answers with `expected_status`
///
/// Refused, reset and timed out requests count as "not yet", as does any
/// other status; remaining errors (a malformed URL, say) fail the check.
pub async fn once_http_ok(url: &str, expected_status: u16) -> Result<(), BoxError> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .build()?;

    once_async_test(POLL_INTERVAL, || {
        let request = client.get(url).send();
        async move {
            match request.await {
                Ok(response) => Ok(response.status().as_u16() == expected_status),
                Err(e) if is_not_listening_yet(&e) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    })
    .await
}

fn is_not_listening_yet(error: &reqwest::Error) -> bool {
    if error.is_connect() || error.is_timeout() {
        return true;
    }

    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::TimedOut
            );
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[test]
    fn test_once_output_line_is_waits_for_match() {
        let (tx, lines) = OutputLines::channel();
        let mut ctx = ReadyContext::new("web", lines);
        let mut ready = task::spawn(ctx.once_output_line_is("Listening"));

        assert_pending!(ready.poll());
        tx.send("Booting".to_string()).unwrap();
        assert_pending!(ready.poll());
        tx.send("Listening".to_string()).unwrap();
        assert!(ready.is_woken());
        assert_ready_ok!(ready.poll());
    }

    #[test]
    fn test_once_output_line_includes() {
        let (tx, lines) = OutputLines::channel();
        let mut ctx = ReadyContext::new("web", lines);
        tx.send("server listening on :3000".to_string()).unwrap();

        let mut ready = task::spawn(ctx.once_output_line_includes("listening"));
        assert_ready_ok!(ready.poll());
    }

    #[test]
    fn test_once_output_line_pends_after_output_ends() {
        let (tx, lines) = OutputLines::channel();
        let mut ctx = ReadyContext::new("web", lines);
        tx.send("no match here".to_string()).unwrap();
        drop(tx);

        let mut ready = task::spawn(ctx.once_output_line_is("Ready"));
        assert_pending!(ready.poll());
    }

    #[test]
    fn test_custom_line_test() {
        let (tx, lines) = OutputLines::channel();
        let mut ctx = ReadyContext::new("worker", lines);
        tx.send("jobs: 1".to_string()).unwrap();
        tx.send("jobs: 12".to_string()).unwrap();

        let mut ready = task::spawn(ctx.once_output_line(|line| line.len() > 7));
        assert_ready_ok!(ready.poll());
    }

    #[tokio::test]
    async fn test_once_tcp_port_used() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::time::timeout(Duration::from_secs(5), once_tcp_port_used(port, "127.0.0.1"))
            .await
            .expect("port check timed out")
            .unwrap();
    }

    /// Answer every connection with `status` and an empty body
    async fn serve_status(listener: tokio::net::TcpListener, status: &'static str) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                status
            );
            let _ = stream.write_all(response.as_bytes()).await;
        }
    }

    #[tokio::test]
    async fn test_once_http_ok() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://127.0.0.1:{}/health", listener.local_addr().unwrap().port());
        tokio::spawn(serve_status(listener, "200 OK"));

        tokio::time::timeout(Duration::from_secs(5), once_http_ok(&url, HTTP_OK))
            .await
            .expect("http check timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn test_once_http_ok_waits_for_expected_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://127.0.0.1:{}/", listener.local_addr().unwrap().port());
        tokio::spawn(serve_status(listener, "503 Service Unavailable"));

        let result = tokio::time::timeout(Duration::from_millis(800), once_http_ok(&url, HTTP_OK)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_once_http_ok_waits_for_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = format!("http://{}/", addr);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
            serve_status(listener, "204 No Content").await;
        });

        let ctx = ReadyContext::new("api", OutputLines::channel().1);
        tokio::time::timeout(Duration::from_secs(5), ctx.once_http_ok(&url, 204))
            .await
            .expect("http check timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn test_once_http_ok_rejects_bad_url() {
        let result = once_http_ok("not a url", HTTP_OK).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_once_async_test_polls_until_true() {
        let mut attempts = 0;
        once_async_test(Duration::from_millis(5), || {
            attempts += 1;
            let done = attempts >= 3;
            async move { Ok(done) }
        })
        .await
        .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_once_async_test_propagates_errors() {
        let result = once_async_test(Duration::from_millis(5), || async {
            Err::<bool, BoxError>("check failed".into())
        })
        .await;
        assert_eq!(result.unwrap_err().to_string(), "check failed");
    }
}
