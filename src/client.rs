//! Interactive and scripted client.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use futures::StreamExt;
use rsh_core::{ClientSettings, Frame, Marker, ResponseCodec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, Stdin};
use tokio_util::codec::{FramedRead, LinesCodec};

/// Why the client stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    Quit,
    Halted,
    Aborted,
    ServerClosed,
    InputExhausted,
}

/// Where command lines come from.
pub enum LineSource {
    Interactive(FramedRead<Stdin, LinesCodec>),
    Queued(VecDeque<String>),
}

impl LineSource {
    pub fn stdin() -> Self {
        Self::Interactive(FramedRead::new(tokio::io::stdin(), LinesCodec::new()))
    }

    pub fn command(line: impl Into<String>) -> Self {
        Self::Queued(VecDeque::from([line.into()]))
    }

    /// One command per line; blank lines and `#` comments are skipped.
    pub fn script(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading script {}", path.display()))?;
        Ok(Self::Queued(script_lines(&text)))
    }

    fn is_interactive(&self) -> bool {
        matches!(self, Self::Interactive(_))
    }

    async fn next_line(&mut self, out: &mut impl Write) -> anyhow::Result<Option<String>> {
        match self {
            Self::Queued(lines) => Ok(lines.pop_front()),
            Self::Interactive(stdin) => loop {
                write!(out, "{} ", prompt())?;
                out.flush()?;
                match stdin.next().await {
                    None => return Ok(None),
                    Some(line) => {
                        let line = line.context("reading standard input")?;
                        if !line.trim().is_empty() {
                            return Ok(Some(line));
                        }
                    }
                }
            },
        }
    }
}

fn script_lines(text: &str) -> VecDeque<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// `HH:MM user@host# ` with ANSI colours.
pub fn prompt() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let uname = rustix::system::uname();
    let host = uname.nodename().to_string_lossy();
    let time = chrono::Local::now().format("%H:%M");
    format!("\x1b[33m{time}\x1b[0m \x1b[32m{user}\x1b[0m@\x1b[34m{host}\x1b[0m#")
}

/// Connect to the configured endpoint and run `source` against it.
pub async fn run(settings: &ClientSettings, source: LineSource) -> anyhow::Result<Exit> {
    let (reader, writer) = rsh_server::connect(&settings.endpoint)
        .await
        .with_context(|| format!("connecting to {}", settings.endpoint))?;
    tracing::debug!(endpoint = %settings.endpoint, "connected");

    let mut stdout = std::io::stdout();
    if source.is_interactive() {
        writeln!(stdout, "[INFO] Connected to server.")?;
    }
    let codec = ResponseCodec::with_max_frame_len(settings.max_frame_bytes);
    converse(reader, writer, codec, source, &mut stdout).await
}

/// Send one line at a time, printing each response before the next is sent.
pub async fn converse<R, W>(
    reader: R,
    mut writer: W,
    codec: ResponseCodec,
    mut source: LineSource,
    out: &mut impl Write,
) -> anyhow::Result<Exit>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, codec);
    loop {
        let Some(line) = source.next_line(out).await? else {
            if source.is_interactive() {
                writeln!(out, "\nExiting.")?;
            }
            return Ok(Exit::InputExhausted);
        };

        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let frame = match frames.next().await {
            Some(frame) => frame.context("reading response")?,
            None => {
                writeln!(out, "[ERROR] Connection to server was closed.")?;
                return Ok(Exit::ServerClosed);
            }
        };
        if let Some(exit) = render(&frame, out)? {
            return Ok(exit);
        }
    }
}

fn render(frame: &Frame, out: &mut impl Write) -> anyhow::Result<Option<Exit>> {
    out.write_all(&frame.body)?;
    let exit = match frame.marker {
        Marker::End => None,
        Marker::Quit => {
            writeln!(out, "[CLIENT] Quit command issued. Disconnecting.")?;
            Some(Exit::Quit)
        }
        Marker::Halt => {
            writeln!(out, "[INFO] Server requested shutdown. Exiting.")?;
            Some(Exit::Halted)
        }
        Marker::Abort => {
            writeln!(out, "[INFO] Connection aborted by another session.")?;
            Some(Exit::Aborted)
        }
    };
    out.flush()?;
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    /// Answers each received line with the next canned reply. The line after
    /// the last reply is read and dropped, then the server hangs up.
    fn fake_server(replies: Vec<&'static [u8]>) -> (tokio::io::DuplexStream, tokio::task::JoinHandle<Vec<String>>) {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            for reply in replies {
                let Some(line) = lines.next_line().await.unwrap() else {
                    return received;
                };
                received.push(line);
                write.write_all(reply).await.unwrap();
            }
            let _ = lines.next_line().await;
            received
        });
        (client, task)
    }

    async fn drive(replies: Vec<&'static [u8]>, source: LineSource) -> (Exit, String, Vec<String>) {
        let (client, server) = fake_server(replies);
        let (read, write) = tokio::io::split(client);
        let mut out = Vec::new();
        let exit = converse(read, write, ResponseCodec::new(), source, &mut out).await.unwrap();
        let received = server.await.unwrap();
        (exit, String::from_utf8(out).unwrap(), received)
    }

    #[tokio::test]
    async fn prints_bodies_until_input_runs_out() {
        let source = LineSource::Queued(VecDeque::from(["echo a".to_string(), "echo b".to_string()]));
        let (exit, out, received) = drive(vec![b"a\n[END]", b"b\n[END]"], source).await;
        assert_eq!(exit, Exit::InputExhausted);
        assert_eq!(out, "a\nb\n");
        assert_eq!(received, ["echo a", "echo b"]);
    }

    #[tokio::test]
    async fn quit_marker_disconnects() {
        let (exit, out, _) = drive(vec![b"[QUIT]"], LineSource::command("quit")).await;
        assert_eq!(exit, Exit::Quit);
        assert_eq!(out, "[CLIENT] Quit command issued. Disconnecting.\n");
    }

    #[tokio::test]
    async fn halt_and_abort_markers() {
        let (exit, out, _) = drive(vec![b"bye\n[HALT]"], LineSource::command("halt")).await;
        assert_eq!(exit, Exit::Halted);
        assert_eq!(out, "bye\n[INFO] Server requested shutdown. Exiting.\n");

        let (exit, _, _) = drive(vec![b"[ABORT]"], LineSource::command("ls")).await;
        assert_eq!(exit, Exit::Aborted);
    }

    #[tokio::test]
    async fn stops_after_signal_even_with_lines_left() {
        let source = LineSource::Queued(VecDeque::from(["a".to_string(), "b".to_string()]));
        let (exit, _, received) = drive(vec![b"[ABORT]", b"x[END]"], source).await;
        assert_eq!(exit, Exit::Aborted);
        assert_eq!(received, ["a"]);
    }

    #[tokio::test]
    async fn server_hangup_is_reported() {
        let (exit, out, _) = drive(vec![], LineSource::command("ls")).await;
        assert_eq!(exit, Exit::ServerClosed);
        assert_eq!(out, "[ERROR] Connection to server was closed.\n");
    }

    #[test]
    fn script_skips_blanks_and_comments() {
        let lines = script_lines("# setup\n\necho one\n   \n  # indented comment\ncd /tmp ; ls\n");
        assert_eq!(lines, ["echo one", "cd /tmp ; ls"]);
    }

    #[test]
    fn script_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.rsh");
        std::fs::write(&path, "echo hi\n").unwrap();
        let LineSource::Queued(lines) = LineSource::script(&path).unwrap() else {
            panic!("expected queued lines");
        };
        assert_eq!(lines, ["echo hi"]);
        assert!(LineSource::script(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn prompt_shape() {
        let prompt = prompt();
        assert!(prompt.contains('@'));
        assert!(prompt.ends_with('#'));
        assert!(prompt.contains("\x1b[33m"));
    }
}
