use std::{future::Future, pin::Pin};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{Reply, read_line, write_line},
};

/// Forwards stdin lines to the server and prints every reply.
pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());

    run_client_loop(&mut reader, &mut writer, &mut stdin, tokio::signal::ctrl_c()).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Runs until stdin ends, the server says `BYE` or goes away, or `interrupt`
/// fires. The interrupt is watched while a reply is pending too, so a parked
/// `IN`/`RD`/`EX` can always be abandoned.
async fn run_client_loop<R, W, I, F>(
    reader: &mut R,
    writer: &mut W,
    stdin: &mut I,
    interrupt: F,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    F: Future<Output = io::Result<()>>,
{
    tokio::pin!(interrupt);
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_stdin_input(bytes_read, &input, reader, writer, interrupt.as_mut()).await? {
                    break;
                }
            }
            result = &mut interrupt => {
                handle_ctrl_c(result);
                break;
            }
        }
    }
    Ok(())
}

/// Sends one command and waits for its reply. Blocking commands keep the
/// client waiting here, just as they keep the server-side session waiting.
async fn handle_stdin_input<R, W, F>(
    bytes_read: io::Result<usize>,
    input: &str,
    reader: &mut R,
    writer: &mut W,
    interrupt: Pin<&mut F>,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = io::Result<()>>,
{
    if bytes_read? == 0 {
        return Ok(false);
    }

    let command = input.trim_end();
    if command.trim().is_empty() {
        return Ok(true);
    }

    write_line(writer, command).await?;

    let reply = select! {
        reply = read_line(reader) => reply?,
        result = interrupt => {
            handle_ctrl_c(result);
            return Ok(false);
        }
    };

    match reply {
        Some(reply) => {
            write_stdout(&reply).await?;
            Ok(reply != Reply::Bye.to_string())
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    match result {
        Ok(()) => info!("interrupted, leaving"),
        Err(error) => warn!(?error, "ctrl-c handler failed"),
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
