//! Guest control channel over the runner's `control` serial device.
//!
//! The device is opened twice: once for reading guest lines and once,
//! in append mode, for writing host commands. Each line read is bounded by
//! the configured read timeout; transient I/O errors are retried with
//! exponential backoff before the channel is declared broken.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::{Result, VirtError};
use crate::protocol::{GuestMessage, HostMessage};

/// Lines longer than this are discarded as undecodable.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// What the receive loop should do after a message has been handled.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue,
    Reply(HostMessage),
    Stop,
}

enum RawLine {
    Data(Vec<u8>),
    Overlong,
    Eof,
}

pub struct ControlChannel<R, W> {
    reader: BufReader<R>,
    writer: W,
    read_timeout: Duration,
}

impl ControlChannel<tokio::fs::File, tokio::fs::File> {
    /// Open the control device at `path`.
    pub fn open(path: &Path, read_timeout: Duration) -> Result<Self> {
        let reader = open_device(path, false)?;
        let writer = open_device(path, true)?;
        debug!(device = %path.display(), "control channel opened");
        Ok(Self::new(
            tokio::fs::File::from_std(reader),
            tokio::fs::File::from_std(writer),
            read_timeout,
        ))
    }
}

fn open_device(path: &Path, write: bool) -> std::io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    if write {
        options.append(true);
    } else {
        options.read(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(nix::libc::O_NOCTTY);
    }
    options.open(path)
}

impl<R, W> ControlChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, read_timeout: Duration) -> Self {
        Self { reader: BufReader::new(reader), writer, read_timeout }
    }

    /// Write one host message as a single line.
    pub async fn send(&mut self, message: &HostMessage) -> Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut attempt = 0;
        loop {
            let res = async {
                self.writer.write_all(&line).await?;
                self.writer.flush().await
            }
            .await;
            match res {
                Ok(()) => {
                    debug!(?message, "sent host message");
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(VirtError::Channel(format!("write failed: {e}")));
                    }
                    let delay = backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "control channel write failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Read the next decodable guest message.
    ///
    /// Undecodable and overlong lines are logged and skipped. Returns
    /// `Ok(None)` when the guest side has closed the device.
    pub async fn next_message(&mut self) -> Result<Option<GuestMessage>> {
        loop {
            let raw = match tokio::time::timeout(self.read_timeout, self.read_raw_line()).await {
                Ok(raw) => raw?,
                Err(_) => {
                    return Err(VirtError::Channel(format!(
                        "no message from guest within {:?}",
                        self.read_timeout
                    )));
                }
            };

            let bytes = match raw {
                RawLine::Eof => return Ok(None),
                RawLine::Overlong => {
                    warn!(limit = MAX_LINE_BYTES, "discarding overlong line from guest");
                    continue;
                }
                RawLine::Data(bytes) => bytes,
            };

            let text = String::from_utf8_lossy(&bytes);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<GuestMessage>(text) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => warn!(error = %e, line = %text, "skipping undecodable guest line"),
            }
        }
    }

    /// Feed guest messages to `on_message` until it returns [`Flow::Stop`].
    ///
    /// Closure of the device or a read timeout ends the loop with a
    /// `Channel` error; errors from the handler propagate unchanged.
    pub async fn receive_loop<F>(&mut self, mut on_message: F) -> Result<()>
    where
        F: FnMut(GuestMessage) -> Result<Flow>,
    {
        loop {
            let Some(message) = self.next_message().await? else {
                return Err(VirtError::Channel("control channel closed by guest".to_string()));
            };
            match on_message(message)? {
                Flow::Continue => {}
                Flow::Reply(reply) => self.send(&reply).await?,
                Flow::Stop => return Ok(()),
            }
        }
    }

    async fn read_raw_line(&mut self) -> Result<RawLine> {
        let mut buf = Vec::new();
        let mut attempt = 0;
        loop {
            let budget = (MAX_LINE_BYTES + 1).saturating_sub(buf.len()) as u64;
            match (&mut self.reader).take(budget).read_until(b'\n', &mut buf).await {
                Ok(0) if buf.is_empty() => return Ok(RawLine::Eof),
                Ok(_) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(VirtError::Channel(format!("read failed: {e}")));
                    }
                    let delay = backoff(attempt);
                    warn!(error = %e, attempt, ?delay, "control channel read failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_BYTES {
            self.discard_rest_of_line().await?;
            return Ok(RawLine::Overlong);
        }
        Ok(RawLine::Data(buf))
    }

    async fn discard_rest_of_line(&mut self) -> Result<()> {
        loop {
            let mut sink = Vec::new();
            let n = (&mut self.reader)
                .take(MAX_LINE_BYTES as u64)
                .read_until(b'\n', &mut sink)
                .await
                .map_err(|e| VirtError::Channel(format!("read failed: {e}")))?;
            if n == 0 || sink.last() == Some(&b'\n') {
                return Ok(());
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE_DELAY * 2u32.saturating_pow(attempt.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, duplex};

    #[test]
    fn backoff_doubles_from_base() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(2), Duration::from_millis(200));
        assert_eq!(backoff(4), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn send_writes_one_json_line() {
        let (host_out, guest_in) = duplex(4096);
        let (_guest_out, host_in) = duplex(4096);
        let mut channel = ControlChannel::new(host_in, host_out, Duration::from_secs(1));

        channel.send(&HostMessage::Poweroff).await.unwrap();

        let mut lines = BufReader::new(guest_in).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"message_type":"poweroff"}"#);
    }

    #[tokio::test]
    async fn accepts_crlf_and_skips_garbage() {
        let input = b"not json\r\n\r\n{\"status\": \"initializing\"}\r\n{\"status\":\"initialization_complete\"}\n";
        let mut channel = ControlChannel::new(&input[..], tokio::io::sink(), Duration::from_secs(1));

        assert_eq!(channel.next_message().await.unwrap(), Some(GuestMessage::Initializing));
        assert_eq!(
            channel.next_message().await.unwrap(),
            Some(GuestMessage::InitializationComplete)
        );
        assert_eq!(channel.next_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn overlong_line_is_skipped() {
        let mut input = vec![b'x'; MAX_LINE_BYTES + 10];
        input.extend_from_slice(b"\r\n{\"status\":\"initializing\"}\r\n");
        let mut channel = ControlChannel::new(&input[..], tokio::io::sink(), Duration::from_secs(1));

        assert_eq!(channel.next_message().await.unwrap(), Some(GuestMessage::Initializing));
    }

    #[tokio::test]
    async fn read_times_out_as_channel_error() {
        let (_keep_open, host_in) = duplex(64);
        let mut channel =
            ControlChannel::new(host_in, tokio::io::sink(), Duration::from_millis(50));

        let err = channel.next_message().await.unwrap_err();
        assert!(matches!(err, VirtError::Channel(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn receive_loop_replies_and_stops() {
        let (mut guest_out, host_in) = duplex(4096);
        let (host_out, guest_in) = duplex(4096);
        let mut channel = ControlChannel::new(host_in, host_out, Duration::from_secs(2));

        guest_out
            .write_all(b"{\"status\":\"running\"}\r\n{\"status\":\"running\",\"network_addresses\":[[\"192.168.64.5\",\"255.255.255.0\"]]}\r\n")
            .await
            .unwrap();

        let mut seen = 0;
        channel
            .receive_loop(|msg| {
                let GuestMessage::Heartbeat(hb) = msg else {
                    return Ok(Flow::Continue);
                };
                seen += 1;
                Ok(match hb.primary_address("192.168.") {
                    Some(_) => Flow::Stop,
                    None => Flow::Reply(HostMessage::Status),
                })
            })
            .await
            .unwrap();
        assert_eq!(seen, 2);

        let mut lines = BufReader::new(guest_in).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), r#"{"message_type":"status"}"#);
    }

    #[tokio::test]
    async fn receive_loop_reports_closure() {
        let input = b"{\"status\":\"initializing\"}\n";
        let mut channel = ControlChannel::new(&input[..], tokio::io::sink(), Duration::from_secs(1));

        let err = channel.receive_loop(|_| Ok(Flow::Continue)).await.unwrap_err();
        assert!(matches!(err, VirtError::Channel(_)));
    }

    #[tokio::test]
    async fn open_reads_file_backed_device() {
        let tmp = tempfile::tempdir().unwrap();
        let device = tmp.path().join("control");
        std::fs::write(&device, b"{\"status\":\"initialization_error\"}\r\n").unwrap();

        let mut channel = ControlChannel::open(&device, Duration::from_secs(1)).unwrap();
        assert_eq!(
            channel.next_message().await.unwrap(),
            Some(GuestMessage::InitializationError)
        );
        channel.send(&HostMessage::Status).await.unwrap();

        let content = std::fs::read_to_string(&device).unwrap();
        assert!(content.ends_with("{\"message_type\":\"status\"}\n"));
    }
}
