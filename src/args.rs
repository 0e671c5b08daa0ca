use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Lobby session server for find-the-impostor word games")]
pub struct Args {
    /// The address to listen on
    #[arg(long, default_value = "0.0.0.0:3536", env = "HOST")]
    pub host: SocketAddr,

    /// Path to a JSON word list ([{"word": ..., "hint": ...}, ...]);
    /// the built-in list is used when absent
    #[arg(long, env = "WORD_LIST")]
    pub words: Option<PathBuf>,
}
