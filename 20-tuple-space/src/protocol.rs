//! Line protocol spoken by tuple space clients.
//!
//! One command per line, one reply line per command. Malformed input is a
//! [`ProtocolError`] whose `Display` output is exactly what the client sees.

use std::{collections::VecDeque, fmt, io, mem};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Write {
        key: String,
        value: String,
    },
    Read {
        key: String,
    },
    Take {
        key: String,
    },
    Execute {
        key_in: String,
        key_out: String,
        service_id: String,
    },
    List,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("ERROR Formato: WR chave valor")]
    MalformedWrite,
    #[error("ERROR Formato: RD chave")]
    MalformedRead,
    #[error("ERROR Formato: IN chave")]
    MalformedTake,
    #[error("ERROR Formato: EX chave_entrada chave_saida servico_id")]
    MalformedExecute,
    #[error("ERROR Comando desconhecido")]
    UnknownCommand,
}

impl Command {
    /// Parses one line, without its terminator.
    ///
    /// Verbs are case-sensitive. `WR` keeps everything after the key as the
    /// value, spaces included; other commands ignore trailing tokens.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (verb, rest) = split_token(line);

        match verb {
            "WR" => {
                let (key, value) = split_token(rest);
                if key.is_empty() || value.is_empty() {
                    return Err(ProtocolError::MalformedWrite);
                }
                Ok(Command::Write {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            "RD" => single_key(rest)
                .map(|key| Command::Read { key })
                .ok_or(ProtocolError::MalformedRead),
            "IN" => single_key(rest)
                .map(|key| Command::Take { key })
                .ok_or(ProtocolError::MalformedTake),
            "EX" => {
                let mut args = rest.split_whitespace();
                match (args.next(), args.next(), args.next()) {
                    (Some(key_in), Some(key_out), Some(service_id)) => Ok(Command::Execute {
                        key_in: key_in.to_string(),
                        key_out: key_out.to_string(),
                        service_id: service_id.to_string(),
                    }),
                    _ => Err(ProtocolError::MalformedExecute),
                }
            }
            "LIST" => Ok(Command::List),
            "EXIT" => Ok(Command::Exit),
            _ => Err(ProtocolError::UnknownCommand),
        }
    }
}

/// Splits off the first whitespace-delimited token. The remainder has its
/// leading whitespace removed but is otherwise untouched.
fn split_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(end) => (&input[..end], input[end..].trim_start()),
        None => (input, ""),
    }
}

fn single_key(rest: &str) -> Option<String> {
    rest.split_whitespace().next().map(str::to_string)
}

/// A successful response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Value(String),
    NoService,
    Bye,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str("OK"),
            Reply::Value(value) => write!(f, "OK {value}"),
            Reply::NoService => f.write_str("NO-SERVICE"),
            Reply::Bye => f.write_str("BYE"),
        }
    }
}

/// Reads the next line, without its terminator. Blank lines come back as
/// empty strings so every line the peer sends can be answered.
///
/// Returns `None` once the peer has closed its side of the connection.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    decode_line(line).map(Some)
}

fn decode_line(bytes: Vec<u8>) -> io::Result<String> {
    let mut line =
        String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let end = line.trim_end_matches(LINE_ENDINGS).len();
    line.truncate(end);
    Ok(line)
}

/// Request lines from one client.
///
/// While a command is pending the session keeps reading through
/// [`RequestReader::read_ahead`], which queues any complete lines the client
/// pipelined and reports when the client has gone away.
pub struct RequestReader<R> {
    reader: R,
    queued: VecDeque<String>,
    partial: Vec<u8>,
}

impl<R> RequestReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            queued: VecDeque::new(),
            partial: Vec::new(),
        }
    }

    /// Next request line, serving read-ahead lines first.
    ///
    /// A final line without a terminator is still returned before `None`.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        if let Some(line) = self.queued.pop_front() {
            return Ok(Some(line));
        }

        let read = self.reader.read_until(b'\n', &mut self.partial).await?;
        if read == 0 && self.partial.is_empty() {
            return Ok(None);
        }
        decode_line(mem::take(&mut self.partial)).map(Some)
    }

    /// Waits for more input and queues every line it completes.
    ///
    /// Returns `false` at end of input. Cancel safe: bytes are only consumed
    /// from the reader after they have been copied into the queue.
    pub async fn read_ahead(&mut self) -> io::Result<bool> {
        let buffered = self.reader.fill_buf().await?;
        if buffered.is_empty() {
            return Ok(false);
        }

        let read = buffered.len();
        self.partial.extend_from_slice(buffered);
        self.reader.consume(read);

        while let Some(end) = self.partial.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            self.queued.push_back(decode_line(line)?);
        }
        Ok(true)
    }

    /// Lines read ahead and not yet served.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }
}

/// Writes `line` plus a newline and flushes so the peer sees it immediately.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
