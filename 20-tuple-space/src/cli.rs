use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve a shared tuple space over TCP.
    Server(ServerArgs),
    /// Connect to a server and send commands typed on stdin.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:54321")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the tuple space server.
    #[arg(long, default_value = "127.0.0.1:54321")]
    pub server: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_to_well_known_port() {
        let cli = Cli::try_parse_from(["tuple_space", "server"]).expect("parse");
        match cli.command {
            Command::Server(args) => assert_eq!(args.listen.port(), 54321),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn client_accepts_server_address() {
        let cli = Cli::try_parse_from(["tuple_space", "client", "--server", "10.0.0.7:9000"])
            .expect("parse");
        match cli.command {
            Command::Client(args) => assert_eq!(args.server.to_string(), "10.0.0.7:9000"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(Cli::try_parse_from(["tuple_space", "server", "--listen", "nowhere"]).is_err());
    }
}
