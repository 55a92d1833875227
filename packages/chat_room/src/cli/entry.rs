//! The forced entry point: what a chat identity runs instead of a shell.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use chat_gate::ChannelRequest;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::debug;

use crate::cli::daemon;
use crate::config::{ChatRoomConfig, FileConfig, load_config};
use crate::protocol::{ClientHello, ServerHello, diagnostic};

const REPLY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// What the remote-terminal server hands the entry point.
#[derive(Debug, Clone, Default)]
pub struct EntryEnv {
    pub identity: Option<String>,
    pub secret: Option<String>,
    pub term: Option<String>,
    /// Set when the client asked to run a command instead of a session.
    pub original_command: Option<String>,
}

impl EntryEnv {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            identity: var("CHATROOM_IDENTITY").or_else(|| var("USER")),
            secret: var("CHATROOM_SECRET"),
            term: var("TERM"),
            original_command: var("SSH_ORIGINAL_COMMAND"),
        }
    }

    /// The channel requests this invocation amounts to.
    pub fn requests(&self) -> Vec<ChannelRequest> {
        let mut requests = vec![ChannelRequest::EntryPoint];
        if let Some(command) = &self.original_command {
            requests.push(ChannelRequest::Exec {
                command: command.clone(),
            });
        }
        requests
    }
}

/// Bare `chatroom`: join the chat on stdin/stdout.
pub async fn entry_command(config: &ChatRoomConfig) -> Result<()> {
    let env = EntryEnv::from_env();
    let identity = env
        .identity
        .clone()
        .context("No identity given (set CHATROOM_IDENTITY)")?;
    let secret = match env.secret.clone() {
        Some(secret) => secret,
        None => prompt_secret(&identity)?,
    };

    let hello = ClientHello {
        identity,
        secret,
        term: env.term.clone(),
        requests: env.requests(),
    };

    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("Invalid configuration")?;
    let broker = daemon::ensure_broker(config, &file_config.server.host).await?;
    debug!("Connecting to chat broker (pid {}) at {}", broker.pid, broker.addr());
    let stream = tokio::net::TcpStream::connect(broker.addr())
        .await
        .with_context(|| format!("Failed to connect to chat broker at {}", broker.addr()))?;

    let input = spawn_stdin_reader();
    run_chat(stream, hello, input, tokio::io::stdout()).await
}

/// Handshake, then pipe `input` lines to the broker and broker lines to
/// `output` until either side ends.
pub async fn run_chat<S, W>(
    stream: S,
    hello: ClientHello,
    mut input: mpsc::Receiver<String>,
    mut output: W,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
    W: AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut lines = FramedRead::new(reader, LinesCodec::new());
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    sink.send(serde_json::to_string(&hello)?)
        .await
        .context("Failed to send hello")?;

    let reply = tokio::time::timeout(REPLY_TIMEOUT, lines.next())
        .await
        .context("Chat broker did not answer")?
        .context("Chat broker closed the connection")?
        .context("Failed to read broker reply")?;
    let reply: ServerHello =
        serde_json::from_str(&reply).context("Malformed reply from chat broker")?;

    let identity = match reply {
        ServerHello::Accepted { identity, .. } => identity,
        ServerHello::Rejected { error, message } => {
            debug!("Rejected by broker: {}", error);
            anyhow::bail!("{message}");
        }
    };

    write_line(
        &mut output,
        &diagnostic(&format!("joined as {identity} (Ctrl-D to leave)")),
    )
    .await?;

    loop {
        tokio::select! {
            typed = input.recv() => match typed {
                Some(line) => sink.send(line).await.context("Failed to send message")?,
                None => break,
            },
            shown = lines.next() => match shown {
                Some(Ok(line)) => write_line(&mut output, &line).await?,
                Some(Err(e)) => return Err(e).context("Lost connection to chat broker"),
                None => {
                    write_line(&mut output, &diagnostic("disconnected")).await?;
                    break;
                }
            },
        }
    }
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}

/// Blocking stdin reader on its own thread; the channel closes on EOF.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(64);
    std::thread::spawn(move || forward_lines(std::io::stdin().lock(), &tx));
    rx
}

/// Send each line of `input` until EOF. Bytes that are not UTF-8 are
/// replaced instead of ending the chat.
fn forward_lines<R: BufRead>(mut input: R, tx: &mpsc::Sender<String>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match input.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Failed to read stdin: {}", e);
                break;
            }
        }
        let line = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if tx
            .blocking_send(String::from_utf8_lossy(line).into_owned())
            .is_err()
        {
            break;
        }
    }
}

fn prompt_secret(identity: &str) -> Result<String> {
    let mut stderr = std::io::stderr();
    write!(stderr, "secret for {identity}: ")?;
    stderr.flush()?;

    let mut secret = String::new();
    let read = {
        let _quiet = EchoGuard::new();
        std::io::stdin().read_line(&mut secret)
    };
    writeln!(stderr)?;
    read.context("Failed to read secret")?;
    Ok(secret.trim_end_matches(['\r', '\n']).to_string())
}

/// Turns off terminal echo for its lifetime. Does nothing when stdin is not a tty.
struct EchoGuard {
    #[cfg(unix)]
    original: Option<nix::sys::termios::Termios>,
}

impl EchoGuard {
    fn new() -> Self {
        #[cfg(unix)]
        let original = {
            use nix::sys::termios;
            let stdin = std::io::stdin();
            let original = termios::tcgetattr(&stdin).ok();
            if let Some(original) = &original {
                let mut quiet = original.clone();
                quiet.local_flags.remove(termios::LocalFlags::ECHO);
                let _ = termios::tcsetattr(&stdin, termios::SetArg::TCSANOW, &quiet);
            }
            original
        };

        Self {
            #[cfg(unix)]
            original,
        }
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::termios;
            if let Some(original) = &self.original {
                let stdin = std::io::stdin();
                let _ = termios::tcsetattr(&stdin, termios::SetArg::TCSANOW, original);
            }
        }
    }
}
