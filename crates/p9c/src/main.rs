use {
    clap::{Parser, Subcommand},
    log::{debug, info},
    p9mux::{serialize::read_dirs, *},
    std::time::Duration,
    tokio::io::{self, AsyncReadExt, AsyncWriteExt},
};

mod utils;
use crate::utils::*;

const ROOT_FID: u32 = 0;
const FILE_FID: u32 = 1;

/// An attached session to one file tree
struct Conn {
    client: Client,
    timeout: Duration,
    msize: u32,
}

impl Conn {
    async fn connect(cli: &Cli) -> Result<Conn> {
        let config = Config::default().msize(cli.msize);
        let client = Client::dial(&cli.address, config).await?;
        let timeout = Duration::from_millis(cli.timeout_ms);

        let ctx = Context::background().with_timeout(timeout);
        let (msize, version) = client.version(&ctx, cli.msize, P92000).await?;
        if version != P92000 {
            return res!(io_err!(
                Unsupported,
                format!("server speaks {}, not {}", version, P92000)
            ));
        }
        info!("negotiated {} with msize {}", version, msize);

        Ok(Conn {
            client,
            timeout,
            msize,
        })
    }

    /// Fresh deadline for one request
    fn ctx(&self) -> Context {
        Context::background().with_timeout(self.timeout)
    }

    async fn attach(&self, uname: &str, aname: &str) -> Result<QId> {
        self.client
            .attach(&self.ctx(), ROOT_FID, NOFID, uname, aname)
            .await
    }

    /// Walk `FILE_FID` to `path` from the root
    async fn walk(&self, path: &str) -> Result<QId> {
        let names = split_path(path);
        if names.is_empty() {
            self.client
                .walk(&self.ctx(), ROOT_FID, FILE_FID, &[])
                .await?;
            return Ok(self.client.stat(&self.ctx(), FILE_FID).await?.qid);
        }

        // `FILE_FID` is only in use once the first walk succeeds
        let mut from = ROOT_FID;
        let mut qid = QId::default();
        for chunk in names.chunks(MAXWELEM) {
            let wqids = self.client.walk(&self.ctx(), from, FILE_FID, chunk).await?;
            match wqids.last() {
                Some(last) if wqids.len() == chunk.len() => qid = *last,
                _ => {
                    if from == FILE_FID {
                        self.client.clunk(&self.ctx(), FILE_FID).await?;
                    }
                    return res!(io_err!(NotFound, format!("{}: file does not exist", path)));
                }
            }
            from = FILE_FID;
        }
        Ok(qid)
    }

    /// Largest payload a single read or write may carry
    fn chunk_size(&self, iounit: u32) -> usize {
        match iounit {
            0 => self.msize.saturating_sub(IOHDRSZ) as usize,
            n => n as usize,
        }
    }

    async fn stat(&self, path: &str) -> Result<()> {
        self.walk(path).await?;
        let dir = self.client.stat(&self.ctx(), FILE_FID).await?;
        println!("{}", format_dir(&dir));
        self.client.clunk(&self.ctx(), FILE_FID).await
    }

    async fn ls(&self, path: &str) -> Result<()> {
        let qid = self.walk(path).await?;
        if !qid.is_dir() {
            let dir = self.client.stat(&self.ctx(), FILE_FID).await?;
            println!("{}", format_dir(&dir));
            return self.client.clunk(&self.ctx(), FILE_FID).await;
        }

        let (_, iounit) = self.client.open(&self.ctx(), FILE_FID, om::READ).await?;
        let mut buf = vec![0; self.chunk_size(iounit)];
        let mut offset = 0;
        loop {
            let n = self
                .client
                .read(&self.ctx(), FILE_FID, offset, &mut buf)
                .await?;
            if n == 0 {
                break;
            }
            for dir in read_dirs(&buf[..n])? {
                println!("{}", format_dir(&dir));
            }
            offset += n as u64;
        }
        self.client.clunk(&self.ctx(), FILE_FID).await
    }

    async fn cat(&self, path: &str) -> Result<()> {
        self.walk(path).await?;
        let (qid, iounit) = self.client.open(&self.ctx(), FILE_FID, om::READ).await?;
        if qid.is_dir() {
            self.client.clunk(&self.ctx(), FILE_FID).await?;
            return res!(io_err!(InvalidInput, format!("{}: is a directory", path)));
        }

        let mut stdout = io::stdout();
        let mut buf = vec![0; self.chunk_size(iounit)];
        let mut offset = 0;
        loop {
            let n = self
                .client
                .read(&self.ctx(), FILE_FID, offset, &mut buf)
                .await?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).await?;
            offset += n as u64;
        }
        stdout.flush().await?;
        self.client.clunk(&self.ctx(), FILE_FID).await
    }

    async fn put(&self, path: &str) -> Result<()> {
        let (parent, name) = match path.trim_end_matches('/').rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", path),
        };
        if split_path(name).is_empty() {
            return res!(io_err!(InvalidInput, format!("{}: not a file name", path)));
        }

        self.walk(parent).await?;
        let iounit = match self
            .client
            .create(&self.ctx(), FILE_FID, name, 0o644, om::WRITE)
            .await
        {
            Ok((_, iounit)) => iounit,
            // Most likely the file exists; the fid still refers to the parent
            Err(Error::Remote(e)) => {
                debug!("create of {} failed ({}), opening it instead", name, e);
                let wqids = self
                    .client
                    .walk(&self.ctx(), FILE_FID, FILE_FID, &[name])
                    .await?;
                if wqids.len() != 1 {
                    self.client.clunk(&self.ctx(), FILE_FID).await?;
                    return res!(io_err!(NotFound, format!("{}: {}", path, e)));
                }
                let mode = om::WRITE | om::TRUNC;
                self.client.open(&self.ctx(), FILE_FID, mode).await?.1
            }
            Err(e) => return Err(e),
        };

        let mut stdin = io::stdin();
        let mut buf = vec![0; self.chunk_size(iounit)];
        let mut offset = 0;
        loop {
            let n = stdin.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let mut data = &buf[..n];
            while !data.is_empty() {
                let count = self
                    .client
                    .write(&self.ctx(), FILE_FID, offset, data)
                    .await?;
                let count = (count as usize).min(data.len());
                if count == 0 {
                    return res!(io_err!(WriteZero, "server accepted no data"));
                }
                data = &data[count..];
                offset += count as u64;
            }
        }
        info!("wrote {} bytes to {}", offset, path);
        self.client.clunk(&self.ctx(), FILE_FID).await
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    #[command(subcommand)]
    command: Command,

    /// Maximum message size to negotiate
    #[arg(long, default_value_t = config::DEFAULT_MSIZE)]
    msize: u32,

    /// User to attach as
    #[arg(long, default_value = "nobody")]
    uname: String,

    /// File tree to attach to
    #[arg(long, default_value = "")]
    aname: String,

    /// Deadline of each request in milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the negotiated protocol version and message size
    Version,
    /// Print the metadata of a file
    Stat { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Copy a file to stdout
    Cat { path: String },
    /// Copy stdin to a file, creating it if needed
    Put { path: String },
}

async fn p9c_main(cli: Cli) -> Result<i32> {
    let conn = Conn::connect(&cli).await?;

    let res = match &cli.command {
        Command::Version => {
            println!("{} msize={}", P92000, conn.msize);
            Ok(())
        }
        command => {
            conn.attach(&cli.uname, &cli.aname).await?;
            let res = match command {
                Command::Stat { path } => conn.stat(path).await,
                Command::Ls { path } => conn.ls(path).await,
                Command::Cat { path } => conn.cat(path).await,
                Command::Put { path } => conn.put(path).await,
                Command::Version => Ok(()),
            };
            conn.client.clunk(&conn.ctx(), ROOT_FID).await.and(res)
        }
    };

    conn.client.shutdown().await;
    res.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = p9c_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_flags_and_command() {
        let cli = Cli::parse_from([
            "p9c",
            "tcp!127.0.0.1!564",
            "--msize",
            "4096",
            "--uname",
            "glenda",
            "cat",
            "/lib/profile",
        ]);
        assert_eq!(cli.address, "tcp!127.0.0.1!564");
        assert_eq!(cli.msize, 4096);
        assert_eq!(cli.uname, "glenda");
        assert_eq!(cli.timeout_ms, 5000);
        assert!(matches!(cli.command, Command::Cat { ref path } if path == "/lib/profile"));
    }

    #[test]
    fn ls_defaults_to_root() {
        let cli = Cli::parse_from(["p9c", "unix!/tmp/9p.sock!0", "ls"]);
        assert!(matches!(cli.command, Command::Ls { ref path } if path == "/"));
        assert_eq!(cli.msize, config::DEFAULT_MSIZE);
    }
}
