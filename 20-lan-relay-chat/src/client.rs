use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use futures::StreamExt;
use nanoid::nanoid;
use tokio::{
    io::{self, AsyncRead, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    frame::FileType,
    session::{Session, SessionEvent},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut session, mut events) = Session::login(args.session_config()).await?;

    let mut input = input_lines(tokio::io::stdin());

    let outcome = run_client_loop(&session, &mut events, &mut input, &args).await;
    session.logout().await?;

    outcome
}

// Buffers partial lines across cancelled reads.
fn input_lines<R: AsyncRead>(reader: R) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new())
}

async fn run_client_loop(
    session: &Session,
    events: &mut mpsc::Receiver<SessionEvent>,
    input: &mut FramedRead<tokio::io::Stdin, LinesCodec>,
    args: &ClientArgs,
) -> Result<()> {
    loop {
        select! {
            event = events.recv() => {
                if !handle_event(event, session, args).await? {
                    break;
                }
            }
            line = input.next() => {
                if !handle_stdin_input(line, session).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_event(
    event: Option<SessionEvent>,
    session: &Session,
    args: &ClientArgs,
) -> Result<bool> {
    match event {
        Some(event) => {
            render_event(event, session, args).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** disconnected").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    line: Option<Result<String, LinesCodecError>>,
    session: &Session,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };
    let line = line?;

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(path) = text.strip_prefix("/file ") {
        match send_file_from_path(session, Path::new(path.trim())).await {
            Ok(len) => write_stdout(&format!("*** sent {} ({len} bytes)", path.trim())).await?,
            Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
        }
        return Ok(true);
    }

    session.send_message(text).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

fn file_type_for(path: &Path) -> Result<FileType> {
    path.extension()
        .and_then(|extension| extension.to_str())
        .and_then(FileType::from_extension)
        .ok_or_else(|| anyhow!("only .json and .xml files can be sent"))
}

async fn send_file_from_path(session: &Session, path: &Path) -> Result<usize> {
    let file_type = file_type_for(path)?;
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let len = contents.len();
    session.send_file(file_type, contents).await?;
    Ok(len)
}

async fn save_received(dir: &Path, file_type: FileType, contents: &Bytes) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!("{}.{}", nanoid!(), file_type.extension()));
    tokio::fs::write(&path, contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

async fn render_event(event: SessionEvent, session: &Session, args: &ClientArgs) -> Result<()> {
    match event {
        SessionEvent::Welcome(_) => {
            write_stdout(&format!("*** online as {}", session.name())).await?
        }
        SessionEvent::Announcement(text) | SessionEvent::ChatLine(text) => {
            write_stdout(&text).await?
        }
        SessionEvent::FileReceived {
            file_type,
            contents,
        } => {
            let summary = format!(
                "*** received {} file ({} bytes)",
                file_type.extension(),
                contents.len()
            );
            match &args.download_dir {
                Some(dir) => match save_received(dir, file_type, &contents).await {
                    Ok(path) => {
                        write_stdout(&format!("{summary} saved to {}", path.display())).await?
                    }
                    Err(err) => {
                        write_stdout(&summary).await?;
                        write_stderr(&format!("!!! {err:#}")).await?
                    }
                },
                None => write_stdout(&summary).await?,
            }
        }
        SessionEvent::FileChannelClosed => write_stdout("*** file channel closed").await?,
    }
    Ok(())
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
