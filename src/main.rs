//! depot - client CLI for the depot file service
//!
//! One subcommand per protocol operation, plus `bench`: the load harness
//! that round-trips a whole local tree through the server over many
//! concurrent connections.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use walkdir::WalkDir;

use depot::client::{join_remote, parse_remote, Client, Outcome};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Depot - sandboxed remote file storage over a framed TCP protocol"
)]
struct Args {
    /// Server address (host:port)
    #[arg(long, default_value = "127.0.0.1:9131")]
    addr: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Upload a file
    Put {
        /// Local file to upload
        local: PathBuf,
        /// Remote path, slash-separated (defaults to the file name)
        remote: Option<String>,
        /// Replace the remote file if it already exists
        #[arg(long)]
        overwrite: bool,
    },
    /// Download a file
    Get {
        /// Remote path, slash-separated
        remote: String,
        /// Local directory to save under
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Delete a remote file or directory tree
    Del {
        /// Remote path, slash-separated
        remote: String,
    },
    /// List files under a remote path
    Ls {
        /// Remote path, slash-separated (defaults to the root)
        remote: Option<String>,
    },
    /// Round-trip every file under a local tree through the server
    Bench {
        /// Local source tree
        src: PathBuf,
        /// Worker threads (0 = one per CPU)
        #[arg(short = 'w', long, default_value_t = 0)]
        workers: usize,
        /// Directory for the downloaded copies (defaults to a temp location)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Cmd::Put {
            local,
            remote,
            overwrite,
        } => {
            let remote = match remote {
                Some(r) => parse_remote(&r),
                None => match local.file_name() {
                    Some(name) => vec![name.to_string_lossy().into_owned()],
                    None => bail!("cannot derive a remote name from {}", local.display()),
                },
            };
            if remote.is_empty() {
                bail!("remote path must name a file");
            }
            let name = join_remote(&remote);
            let mut client = Client::connect(&args.addr)?;
            match client.put(&local, &remote, overwrite)? {
                Outcome::Ok => println!("PUT: file sent [{}].", name),
                Outcome::Denied => println!("PUT: permission denied [{}].", name),
                Outcome::Exists => println!("PUT: file exists [{}].", name),
                Outcome::NotCreated => println!("PUT: could not create file [{}].", name),
                other => bail!("unexpected PUT outcome {:?}", other),
            }
        }
        Cmd::Get { remote, out } => {
            let remote = parse_remote(&remote);
            if remote.is_empty() {
                bail!("remote path must name a file");
            }
            let name = join_remote(&remote);
            let mut client = Client::connect(&args.addr)?;
            match client.get(&out, &remote)? {
                Outcome::Ok => println!("GET: file received [{}].", name),
                Outcome::Denied => println!("GET: permission denied [{}].", name),
                Outcome::NotFound => println!("GET: file not exists [{}].", name),
                other => bail!("unexpected GET outcome {:?}", other),
            }
        }
        Cmd::Del { remote } => {
            let remote = parse_remote(&remote);
            let name = join_remote(&remote);
            let mut client = Client::connect(&args.addr)?;
            match client.del(&remote)? {
                Outcome::Ok => println!("DEL: file deleted [{}].", name),
                Outcome::Denied => println!("DEL: permission denied [{}].", name),
                Outcome::NotFound => println!("DEL: file not exists [{}].", name),
                Outcome::NotDeleted => println!("DEL: file not deleted [{}].", name),
                other => bail!("unexpected DEL outcome {:?}", other),
            }
        }
        Cmd::Ls { remote } => {
            let remote = parse_remote(remote.as_deref().unwrap_or(""));
            let mut client = Client::connect(&args.addr)?;
            let (outcome, paths) = client.list(&remote)?;
            match outcome {
                Outcome::Ok => {
                    for path in &paths {
                        println!("{}", join_remote(path));
                    }
                    println!("LST: {} file(s).", paths.len());
                }
                Outcome::Denied => {
                    println!("LST: permission denied [{}].", join_remote(&remote))
                }
                Outcome::NotFound => {
                    println!("LST: dir/file not exists [{}].", join_remote(&remote))
                }
                other => bail!("unexpected LST outcome {:?}", other),
            }
        }
        Cmd::Bench { src, workers, out } => bench(&args.addr, &src, workers, out)?,
    }
    Ok(())
}

/// Clear the server root, then push every file under `src` and pull it back,
/// one connection per file, across a pool of worker threads.
fn bench(addr: &str, src: &Path, workers: usize, out: Option<PathBuf>) -> Result<()> {
    if !src.is_dir() {
        bail!("no such directory: {}", src.display());
    }
    let out_dir = out.unwrap_or_else(|| std::env::temp_dir().join("depot-bench"));
    if out_dir.exists() {
        std::fs::remove_dir_all(&out_dir)
            .with_context(|| format!("clear {}", out_dir.display()))?;
    }

    // remove whatever a previous run left on the server
    let mut client = Client::connect(addr)?;
    let (outcome, existing) = client.list(&[])?;
    if outcome != Outcome::Ok {
        bail!("could not list server root: {:?}", outcome);
    }
    println!("existing file count: {}", existing.len());
    for path in &existing {
        client.del(path)?;
    }
    drop(client);

    let files: Vec<(PathBuf, Vec<String>)> = WalkDir::new(src)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let levels = e
                .path()
                .strip_prefix(src)
                .expect("walked entries live under src")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            (e.path().to_path_buf(), levels)
        })
        .collect();
    if files.is_empty() {
        bail!("nothing to transfer under {}", src.display());
    }

    let workers = if workers == 0 { num_cpus::get() } else { workers };
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("build worker pool")?;

    let bar = ProgressBar::new(files.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
            .expect("static template"),
    );
    let success = AtomicU64::new(0);
    let failure = AtomicU64::new(0);
    let start = Instant::now();

    pool.install(|| {
        files.par_iter().for_each(|(local, remote)| {
            let result = (|| -> Result<()> {
                let mut client = Client::connect(addr)?;
                match client.put(local, remote, false)? {
                    Outcome::Ok => {}
                    other => bail!("put: {:?}", other),
                }
                match client.get(&out_dir, remote)? {
                    Outcome::Ok => {}
                    other => bail!("get: {:?}", other),
                }
                Ok(())
            })();
            match result {
                Ok(()) => {
                    success.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    failure.fetch_add(1, Ordering::Relaxed);
                    bar.println(format!("FAIL [{}]: {:#}", join_remote(remote), e));
                }
            }
            bar.inc(1);
        });
    });
    bar.finish_and_clear();

    println!(
        "bench: {} ok, {} failed, {:.3}s elapsed",
        success.load(Ordering::Relaxed),
        failure.load(Ordering::Relaxed),
        start.elapsed().as_secs_f64()
    );
    println!("downloaded copies under {}", out_dir.display());
    Ok(())
}
