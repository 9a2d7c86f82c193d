/// Newline-delimited JSON transport to the hosting shell.
///
/// Inbound (stdin):   `{"origin": "<origin>", "data": <any>}` per message event.
/// Outbound (stdout): `{"targetOrigin": "<origin>", "message": <envelope>}` per post.
use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{MessageListener, MessagePort, PortError};
use crate::protocol::{Envelope, FrameEvent};

/// Buffered inbound events before the reader applies backpressure.
const LISTENER_CAPACITY: usize = 100;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundPost<'a> {
    target_origin: &'a str,
    message: &'a Envelope,
}

pub struct StdoutPort {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutPort {
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl Default for StdoutPort {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagePort for StdoutPort {
    fn post_message(&self, message: &Envelope, target_origin: &str) -> Result<(), PortError> {
        let line = serde_json::to_string(&OutboundPost {
            target_origin,
            message,
        })
        .map_err(|e| PortError::Encode(e.to_string()))?;

        let mut out = self.out.lock().map_err(|_| PortError::Closed)?;
        writeln!(out, "{line}")
            .and_then(|_| out.flush())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::BrokenPipe => PortError::Closed,
                _ => PortError::Io(e.to_string()),
            })
    }
}

/// Attaches a listener reading message events from `reader`, one JSON
/// object per line. Lines that are not frame events are dropped.
pub fn attach<R>(reader: R) -> MessageListener
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (event_tx, event_rx) = mpsc::channel::<FrameEvent>(LISTENER_CAPACITY);

    let feeder = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<FrameEvent>(&line) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed message event: {e}"),
                    }
                }
                Ok(None) => {
                    debug!("Host shell closed the inbound channel");
                    break;
                }
                Err(e) => {
                    warn!("Inbound channel read error: {e}");
                    break;
                }
            }
        }
    });

    MessageListener::with_feeder(event_rx, feeder)
}

/// Listener on the process's stdin.
pub fn attach_stdin() -> MessageListener {
    attach(tokio::io::stdin())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::protocol::{Envelope, Report};

    /// Writer that keeps everything in a shared buffer.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_post_message_writes_one_line_per_call() {
        let buf = SharedBuf::default();
        let port = StdoutPort::with_writer(Box::new(buf.clone()));
        let envelope = Envelope::result("abc123", Report::Success("ok".into()));

        port.post_message(&envelope, "https://app.deskrex.com").unwrap();
        port.post_message(&envelope, "http://localhost:3000").unwrap();

        let written = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["targetOrigin"], "https://app.deskrex.com");
        assert_eq!(first["message"]["type"], "EXECUTION_RESULT");
        assert_eq!(first["message"]["executionId"], "abc123");
        assert_eq!(first["message"]["payload"]["result"], "ok");
    }

    #[tokio::test]
    async fn test_attach_parses_lines_and_skips_garbage() {
        let input = concat!(
            "{\"origin\":\"https://app.deskrex.com\",\"data\":{\"type\":\"EXECUTE_CODE\"}}\n",
            "not json\n",
            "\n",
            "{\"origin\":\"https://evil.example\"}\n",
        );
        let mut listener = attach(std::io::Cursor::new(input.as_bytes().to_vec()));

        let first = listener.recv().await.unwrap();
        assert_eq!(first.origin, "https://app.deskrex.com");
        assert_eq!(first.data["type"], "EXECUTE_CODE");

        let second = listener.recv().await.unwrap();
        assert_eq!(second.origin, "https://evil.example");
        assert!(second.data.is_null());

        assert!(listener.recv().await.is_none());
    }
}
