//! Logger setup. Everything goes through the `log` facade; `RUST_LOG` overrides the default
//! `info` filter.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;

use env_logger::{Builder, Env, Target};

const LOG_DIR: &str = "logs";

fn builder() -> Builder {
    Builder::from_env(Env::default().default_filter_or("info"))
}

/// The server logs to stderr.
pub fn init_server() {
    let _ = builder().target(Target::Stderr).try_init();
}

/// Where the client for `username` writes its log.
pub fn client_log_path(username: &str) -> PathBuf {
    PathBuf::from(LOG_DIR).join(format!("rooms-join@{}.log", username))
}

fn open_client_log(username: &str) -> io::Result<File> {
    fs::create_dir_all(LOG_DIR)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(client_log_path(username))
}

/// The client's stdout belongs to the chat, so its log goes to a file. Falls back to stderr when
/// the file can't be opened.
pub fn init_client(username: &str) {
    let mut builder = builder();
    match open_client_log(username) {
        Ok(file) => {
            builder.target(Target::Pipe(Box::new(file)));
        }
        Err(err) => {
            eprintln!("couldn't open log file, logging to stderr: {}", err);
            builder.target(Target::Stderr);
        }
    }
    let _ = builder.try_init();
}
