use std::{future::Future, io, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Command, Reply, RequestReader, write_line},
    space::{ExecuteError, Space},
};

pub struct Server {
    listener: TcpListener,
    space: Arc<Space>,
}

impl Server {
    /// Serves a fresh space with the built-in services.
    pub fn new(listener: TcpListener) -> Self {
        Self::with_space(listener, Arc::new(Space::default()))
    }

    pub fn with_space(listener: TcpListener, space: Arc<Space>) -> Self {
        Self { listener, space }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn space(&self) -> Arc<Space> {
        Arc::clone(&self.space)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, space } = self;
        tokio::pin!(shutdown);
        info!(services = space.services().len(), "accepting clients");

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &space);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: io::Result<(TcpStream, SocketAddr)>, space: &Arc<Space>) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, space),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, space: &Arc<Space>) {
    let space = Arc::clone(space);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, space).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, space: Arc<Space>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    info!(%peer, "client connected");
    run_session(&space, &mut reader, &mut writer).await?;
    info!(%peer, "client disconnected");

    Ok(())
}

/// Serves commands from one client until it sends `EXIT` or goes away.
pub async fn run_session<R, W>(space: &Space, reader: &mut R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = RequestReader::new(reader);

    while let Some(line) = requests.next_line().await? {
        debug!(command = %line, "command received");

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                write_line(writer, &err.to_string()).await?;
                continue;
            }
        };

        if command == Command::Exit {
            write_line(writer, &Reply::Bye.to_string()).await?;
            break;
        }

        match dispatch_while_connected(space, command, &mut requests).await? {
            Some(reply) => write_line(writer, &reply.to_string()).await?,
            None => {
                debug!(
                    unanswered = requests.queued(),
                    "client went away while its command was pending"
                );
                break;
            }
        }
    }

    Ok(())
}

/// Runs `command`, giving up if the client hangs up before it completes.
///
/// The operation is always polled before the socket, so a command that can
/// finish right away does so even if the client has already shut down its
/// write side. Dropping a pending operation drops its waiter, which the space
/// prunes on its own. Lines pipelined meanwhile are queued for the session.
async fn dispatch_while_connected<R>(
    space: &Space,
    command: Command,
    requests: &mut RequestReader<R>,
) -> io::Result<Option<Reply>>
where
    R: AsyncBufRead + Unpin,
{
    let operation = dispatch(space, command);
    tokio::pin!(operation);

    loop {
        select! {
            biased;
            reply = &mut operation => return Ok(Some(reply)),
            open = requests.read_ahead() => {
                if !open? {
                    return Ok(None);
                }
            }
        }
    }
}

async fn dispatch(space: &Space, command: Command) -> Reply {
    match command {
        Command::Write { key, value } => {
            space.write(&key, &value);
            Reply::Ok
        }
        Command::Read { key } => Reply::Value(space.read(&key).await),
        Command::Take { key } => Reply::Value(space.take(&key).await),
        Command::Execute {
            key_in,
            key_out,
            service_id,
        } => match space.execute(&key_in, &key_out, &service_id).await {
            Ok(()) => Reply::Ok,
            Err(ExecuteError::NoService(_)) => Reply::NoService,
        },
        Command::List => {
            let snapshot = space.snapshot();
            info!(keys = snapshot.entries.len(), "listing requested\n{snapshot}");
            Reply::Ok
        }
        Command::Exit => Reply::Bye,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf},
        time::timeout,
    };

    use super::*;
    use crate::protocol::read_line;

    type Client = (BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>);

    fn start_session(space: &Arc<Space>) -> (Client, tokio::task::JoinHandle<Result<()>>) {
        let (client, server) = tokio::io::duplex(4096);
        let (server_reader, mut server_writer) = tokio::io::split(server);
        let space = Arc::clone(space);
        let session = tokio::spawn(async move {
            let mut server_reader = BufReader::new(server_reader);
            run_session(&space, &mut server_reader, &mut server_writer).await
        });

        let (client_reader, client_writer) = tokio::io::split(client);
        ((BufReader::new(client_reader), client_writer), session)
    }

    async fn request(client: &mut Client, line: &str) -> String {
        write_line(&mut client.1, line).await.expect("send command");
        timeout(Duration::from_secs(1), read_line(&mut client.0))
            .await
            .expect("reply in time")
            .expect("read reply")
            .expect("session open")
    }

    #[tokio::test]
    async fn session_answers_each_command() {
        let space = Arc::new(Space::default());
        let (mut client, session) = start_session(&space);

        assert_eq!(request(&mut client, "WR A hello world").await, "OK");
        assert_eq!(request(&mut client, "RD A").await, "OK hello world");
        assert_eq!(request(&mut client, "EX A B 1").await, "OK");
        assert_eq!(request(&mut client, "IN B").await, "OK HELLO WORLD");
        assert_eq!(request(&mut client, "LIST").await, "OK");
        assert_eq!(request(&mut client, "EXIT").await, "BYE");

        session.await.expect("join").expect("session ends cleanly");
    }

    #[tokio::test]
    async fn session_reports_errors_and_stays_open() {
        let space = Arc::new(Space::default());
        let (mut client, _session) = start_session(&space);

        assert_eq!(request(&mut client, "WR A").await, "ERROR Formato: WR chave valor");
        assert_eq!(request(&mut client, "RD").await, "ERROR Formato: RD chave");
        assert_eq!(request(&mut client, "IN").await, "ERROR Formato: IN chave");
        assert_eq!(
            request(&mut client, "EX A").await,
            "ERROR Formato: EX chave_entrada chave_saida servico_id"
        );
        assert_eq!(request(&mut client, "HELLO").await, "ERROR Comando desconhecido");

        assert_eq!(request(&mut client, "WR A x").await, "OK");
        assert_eq!(request(&mut client, "EX A B 999").await, "NO-SERVICE");
        assert_eq!(request(&mut client, "IN A").await, "OK x");
        assert!(space.snapshot().is_empty());
    }

    #[tokio::test]
    async fn pipelined_commands_are_answered_in_order() {
        let space = Arc::new(Space::default());
        let (mut client, _session) = start_session(&space);

        client
            .1
            .write_all(b"IN k\nWR other v\n")
            .await
            .expect("pipeline");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The take is still parked; the pipelined write must wait behind it.
        assert!(space.snapshot().values("other").is_empty());

        space.write("k", "released");
        let first = timeout(Duration::from_secs(1), read_line(&mut client.0))
            .await
            .expect("reply in time")
            .expect("read");
        assert_eq!(first.as_deref(), Some("OK released"));
        let second = timeout(Duration::from_secs(1), read_line(&mut client.0))
            .await
            .expect("reply in time")
            .expect("read");
        assert_eq!(second.as_deref(), Some("OK"));
        assert_eq!(space.snapshot().values("other"), ["v"]);
    }

    #[tokio::test]
    async fn hanging_up_abandons_pending_take() {
        let space = Arc::new(Space::default());
        let (mut client, session) = start_session(&space);

        write_line(&mut client.1, "IN k").await.expect("send take");
        timeout(Duration::from_secs(1), async {
            while space.waiting() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("take parks");

        drop(client);
        timeout(Duration::from_secs(1), session)
            .await
            .expect("session ends")
            .expect("join")
            .expect("clean end");

        space.write("k", "unclaimed");
        assert_eq!(space.waiting(), 0);
        assert_eq!(space.snapshot().values("k"), ["unclaimed"]);
    }

    #[tokio::test]
    async fn blank_lines_are_answered() {
        let space = Arc::new(Space::default());
        let (mut client, session) = start_session(&space);

        client.1.write_all(b"\n   \nEXIT\n").await.expect("send");

        let mut replies = Vec::new();
        while let Some(reply) = timeout(Duration::from_secs(1), read_line(&mut client.0))
            .await
            .expect("reply in time")
            .expect("read reply")
        {
            replies.push(reply);
        }
        assert_eq!(
            replies,
            ["ERROR Comando desconhecido", "ERROR Comando desconhecido", "BYE"]
        );
        session.await.expect("join").expect("session ends cleanly");
    }

    #[tokio::test]
    async fn half_closed_client_still_gets_its_reply() {
        let space = Arc::new(Space::default());
        let (mut client, session) = start_session(&space);

        client.1.write_all(b"WR k v\nLIST\n").await.expect("send");
        client.1.shutdown().await.expect("half close");

        for expected in ["OK", "OK"] {
            let reply = timeout(Duration::from_secs(1), read_line(&mut client.0))
                .await
                .expect("reply in time")
                .expect("read reply");
            assert_eq!(reply.as_deref(), Some(expected));
        }
        assert_eq!(space.snapshot().values("k"), ["v"]);

        timeout(Duration::from_secs(1), session)
            .await
            .expect("session ends")
            .expect("join")
            .expect("clean end");
    }

    #[tokio::test]
    async fn hanging_up_after_pipelining_abandons_pending_take() {
        let space = Arc::new(Space::default());
        let (mut client, session) = start_session(&space);

        client.1.write_all(b"IN k\nWR x y\n").await.expect("pipeline");
        timeout(Duration::from_secs(1), async {
            while space.waiting() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("take parks");

        drop(client);
        timeout(Duration::from_secs(1), session)
            .await
            .expect("session ends")
            .expect("join")
            .expect("clean end");

        space.write("k", "unclaimed");
        assert_eq!(space.waiting(), 0);
        assert_eq!(space.snapshot().values("k"), ["unclaimed"]);
        // Nobody is left to answer, so the queued write never runs.
        assert!(space.snapshot().values("x").is_empty());
    }
}
