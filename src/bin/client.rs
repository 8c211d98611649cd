use std::fmt::{Display, Formatter};
use std::error::Error;
use std::io::Write;

use clap::Parser;
use futures::future::{self, Either};
use termion::{color, style};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Line oriented client for the broadcast chat server.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address of the chat server
    #[arg(short, long, default_value = "127.0.0.1:8000")]
    address: String,
}

#[derive(Debug)]
enum UserError {
    ConnectionError(std::io::Error),
    ReadError(std::io::Error),
    WriteError(std::io::Error),
}

impl Display for UserError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self {
            UserError::ConnectionError(e) => write!(f, "connection error: {e}"),
            UserError::ReadError(e) => write!(f, "read error: {e}"),
            UserError::WriteError(e) => write!(f, "write error: {e}"),
        }
    }
}

impl Error for UserError {}

fn is_notice(line: &str) -> bool {
    line.ends_with(" has arrived") || line.ends_with(" has left") || line.starts_with("closing connection after timeout")
}

/// Decides which server lines get highlighted.
///
/// The roster header is only recognised as the `address` line directly followed by `----`,
/// so a peer whose name happens to be one of those is printed plainly.
#[derive(Debug, Default)]
struct Highlighter {
    held_header: bool,
}

impl Highlighter {
    /// Returns the lines ready to print, each paired with whether it is highlighted.
    fn feed(&mut self, line: String) -> Vec<(String, bool)> {
        if self.held_header {
            self.held_header = false;
            if line == "----" {
                return vec![(String::from("address"), true), (line, true)];
            }
            let mut ready = vec![(String::from("address"), false)];
            ready.extend(self.feed(line));
            return ready;
        }
        if line == "address" {
            self.held_header = true;
            return Vec::new();
        }
        let notice = is_notice(&line);
        vec![(line, notice)]
    }

    /// Releases a header line still waiting for its separator.
    fn flush(&mut self) -> Option<String> {
        std::mem::take(&mut self.held_header).then(|| String::from("address"))
    }
}

fn print_line(line: &str, highlight: bool) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    if highlight {
        writeln!(stdout, "{}{}{}{}", style::Italic, color::Fg(color::Yellow), line, style::Reset)
    } else {
        writeln!(stdout, "{line}")
    }
}

/// Prints every line from the server until it closes the connection.
async fn from_server(server: OwnedReadHalf) -> Result<(), UserError> {
    let tty = termion::is_tty(&std::io::stdout());
    let mut highlighter = Highlighter::default();
    let mut lines = BufReader::new(server).lines();
    while let Some(line) = lines.next_line().await.map_err(UserError::ReadError)? {
        for (line, highlight) in highlighter.feed(line) {
            print_line(&line, tty && highlight).map_err(UserError::WriteError)?;
        }
    }
    if let Some(line) = highlighter.flush() {
        print_line(&line, false).map_err(UserError::WriteError)?;
    }
    println!("Connection closed by server");
    Ok(())
}

/// Sends every line typed on stdin to the server.
async fn to_server(mut server: OwnedWriteHalf) -> Result<(), UserError> {
    let mut lines = BufReader::new(io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(UserError::ReadError)? {
        server.write_all(line.as_bytes()).await.map_err(UserError::WriteError)?;
        server.write_all(b"\n").await.map_err(UserError::WriteError)?;
    }
    server.shutdown().await.map_err(UserError::WriteError)
}

async fn run(args: Args) -> Result<(), UserError> {
    println!("Connecting to {}...", args.address);
    let stream = TcpStream::connect(&args.address).await.map_err(UserError::ConnectionError)?;
    let (reader, writer) = stream.into_split();

    let incoming = Box::pin(from_server(reader));
    let outgoing = Box::pin(to_server(writer));

    match future::select(incoming, outgoing).await {
        Either::Left((res, _)) => res,
        // stdin is done, keep printing until the server hangs up
        Either::Right((Ok(()), incoming)) => incoming.await,
        Either::Right((Err(e), _)) => Err(e),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("error from client main: {e}");
    }
}
