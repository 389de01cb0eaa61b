//! Blocking protocol client.
//!
//! One request in flight at a time over a plain `TcpStream`; each operation
//! writes its request frame, waits for the matching ack, and streams the
//! payload if one follows. Used by the `depot` CLI and as the load generator
//! for the bench harness. Any framing or socket failure is surfaced as an
//! error and the transfer abandoned - no retry.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::frame::Frame;
use crate::listing;
use crate::protocol::{Action, Message, FIXED_SECTION_LEN, IO_CHUNK, MAX_HEADER_SIZE};

/// Protocol-level result of one operation. Transport failures are `Err`s
/// instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Denied,
    Exists,
    NotFound,
    NotCreated,
    NotDeleted,
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: &str) -> Result<Client> {
        let stream = TcpStream::connect(addr).with_context(|| format!("connect {}", addr))?;
        let _ = stream.set_nodelay(true);
        Ok(Client { stream })
    }

    /// Upload `local` to the remote `path`. Returns [`Outcome::Ok`] only
    /// once the server confirmed the full payload landed.
    pub fn put(&mut self, local: &Path, path: &[String], overwrite: bool) -> Result<Outcome> {
        let len = fs::metadata(local)
            .with_context(|| format!("stat {}", local.display()))?
            .len();
        let mut request = Frame::request(Action::Put, path.to_vec());
        request.data_length = len;
        request.set_overwrite(overwrite);
        self.send(&request)?;

        let ack = self.read_frame()?;
        self.expect_action(&ack, Action::PutAck)?;
        match ack.message {
            Message::PermissionDenied => Ok(Outcome::Denied),
            Message::FileExist => Ok(Outcome::Exists),
            Message::FileNotCreated => Ok(Outcome::NotCreated),
            Message::FileCreated => {
                if len == 0 {
                    return Ok(Outcome::Ok);
                }
                self.send_file(local, len)?;
                let fin = self.read_frame()?;
                self.expect_action(&fin, Action::PutFin)?;
                Ok(Outcome::Ok)
            }
            other => bail!("unexpected message {:?} in PUT ack", other),
        }
    }

    /// Download the remote `path` into `dest_root`, recreating the remote
    /// level structure underneath it.
    pub fn get(&mut self, dest_root: &Path, path: &[String]) -> Result<Outcome> {
        let request = Frame::request(Action::Get, path.to_vec());
        self.send(&request)?;

        let ack = self.read_frame()?;
        self.expect_action(&ack, Action::GetAck)?;
        match ack.message {
            Message::PermissionDenied => Ok(Outcome::Denied),
            Message::FileNotExist => Ok(Outcome::NotFound),
            Message::FileExist => {
                let dest: PathBuf = dest_root.join(path.iter().collect::<PathBuf>());
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create {}", parent.display()))?;
                }
                let mut file = File::create(&dest)
                    .with_context(|| format!("create {}", dest.display()))?;
                if ack.data_length > 0 {
                    self.recv_payload(ack.data_length, &mut file)?;
                }
                file.flush()?;
                Ok(Outcome::Ok)
            }
            other => bail!("unexpected message {:?} in GET ack", other),
        }
    }

    /// Delete the remote file or directory tree at `path`.
    pub fn del(&mut self, path: &[String]) -> Result<Outcome> {
        let request = Frame::request(Action::Del, path.to_vec());
        self.send(&request)?;

        let ack = self.read_frame()?;
        self.expect_action(&ack, Action::DelAck)?;
        match ack.message {
            Message::PermissionDenied => Ok(Outcome::Denied),
            Message::FileNotExist => Ok(Outcome::NotFound),
            Message::FileDeleted => Ok(Outcome::Ok),
            Message::FileNotDeleted => Ok(Outcome::NotDeleted),
            other => bail!("unexpected message {:?} in DEL ack", other),
        }
    }

    /// List files under the remote `path` (empty = the whole root), as
    /// root-relative level sequences.
    pub fn list(&mut self, path: &[String]) -> Result<(Outcome, Vec<Vec<String>>)> {
        let request = Frame::request(Action::Lst, path.to_vec());
        self.send(&request)?;

        let ack = self.read_frame()?;
        self.expect_action(&ack, Action::LstAck)?;
        match ack.message {
            Message::PermissionDenied => Ok((Outcome::Denied, vec![])),
            Message::FileNotExist => Ok((Outcome::NotFound, vec![])),
            Message::FileExist => {
                if ack.data_length == 0 {
                    return Ok((Outcome::Ok, vec![]));
                }
                let mut blob = Vec::with_capacity(ack.data_length as usize);
                self.recv_payload(ack.data_length, &mut blob)?;
                let paths = listing::unpack(&blob).context("unpack listing")?;
                Ok((Outcome::Ok, paths))
            }
            other => bail!("unexpected message {:?} in LST ack", other),
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        self.stream
            .write_all(&frame.encode())
            .context("send request")?;
        self.stream.flush().context("send request")?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let mut prefix = [0u8; 4];
        self.stream
            .read_exact(&mut prefix)
            .context("read response header")?;
        let total = u32::from_be_bytes(prefix) as usize;
        if !(FIXED_SECTION_LEN..=MAX_HEADER_SIZE).contains(&total) {
            bail!("response header length {} out of range", total);
        }
        let mut bytes = vec![0u8; total];
        bytes[..4].copy_from_slice(&prefix);
        self.stream
            .read_exact(&mut bytes[4..])
            .context("read response header")?;
        Ok(Frame::decode(&bytes)?)
    }

    fn expect_action(&self, frame: &Frame, action: Action) -> Result<()> {
        if frame.action != action {
            bail!("unexpected action {:?}, wanted {:?}", frame.action, action);
        }
        Ok(())
    }

    fn send_file(&mut self, local: &Path, len: u64) -> Result<()> {
        let mut file =
            File::open(local).with_context(|| format!("open {}", local.display()))?;
        let mut buf = vec![0u8; IO_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file.read(&mut buf[..want]).context("file read")?;
            if n == 0 {
                bail!("{} shrank mid-transfer", local.display());
            }
            self.stream.write_all(&buf[..n]).context("payload write")?;
            remaining -= n as u64;
        }
        self.stream.flush().context("payload write")?;
        Ok(())
    }

    fn recv_payload<W: Write>(&mut self, len: u64, dest: &mut W) -> Result<()> {
        let mut buf = vec![0u8; IO_CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = self.stream.read(&mut buf[..want]).context("payload read")?;
            if n == 0 {
                bail!("connection closed with {} payload bytes missing", remaining);
            }
            dest.write_all(&buf[..n]).context("payload store")?;
            remaining -= n as u64;
        }
        Ok(())
    }
}

/// Split a slash-separated remote path into protocol levels. Empty segments
/// collapse, so `a//b/` and `a/b` address the same file and `""` is the root.
pub fn parse_remote(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Join protocol levels for display.
pub fn join_remote(levels: &[String]) -> String {
    levels.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_remote_collapses_empty_segments() {
        assert_eq!(parse_remote("a/b.txt"), vec!["a", "b.txt"]);
        assert_eq!(parse_remote("/a//b/"), vec!["a", "b"]);
        assert_eq!(parse_remote(""), Vec::<String>::new());
    }

    #[test]
    fn join_remote_round_trips_display_form() {
        let levels = parse_remote("dir/sub/file.bin");
        assert_eq!(join_remote(&levels), "dir/sub/file.bin");
    }
}
