//! 9P2000 filesystem operations on top of [`Client::rpc`].

use {
    crate::{
        client::Client,
        context::Context,
        error::Error,
        fcall::*,
        utils::Result,
    },
    async_trait::async_trait,
    log::debug,
};

/// The filesystem operations of a 9P2000 client.
///
/// Every call carries a [`Context`] bounding how long it may wait. Errors
/// replied by the server come back as [`Error::Remote`] (or [`Error::No`]
/// for servers speaking the Linux dialect).
#[async_trait]
pub trait Session: Send + Sync {
    /// Negotiate the protocol version and maximum message size.
    ///
    /// Returns the server's `(msize, version)`, and from then on holds
    /// requests to the returned msize. Must be the first request on a
    /// connection.
    async fn version(&self, ctx: &Context, msize: u32, version: &str) -> Result<(u32, String)>;

    /// Open `afid` for an authentication exchange
    async fn auth(&self, ctx: &Context, afid: u32, uname: &str, aname: &str) -> Result<QId>;

    /// Bind `fid` to the root of the file tree named by `aname`
    async fn attach(
        &self,
        ctx: &Context,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
    ) -> Result<QId>;

    async fn clunk(&self, ctx: &Context, fid: u32) -> Result<()>;

    /// Remove the file behind `fid`; the fid is clunked even if this fails
    async fn remove(&self, ctx: &Context, fid: u32) -> Result<()>;

    /// Walk `newfid` from `fid` through `wnames`.
    ///
    /// A partial walk is not an error: fewer qids than names come back and
    /// `newfid` is left unused.
    async fn walk(&self, ctx: &Context, fid: u32, newfid: u32, wnames: &[&str]) -> Result<Vec<QId>>;

    /// Read at most `buf.len()` bytes at `offset`, returning how many were read
    async fn read(&self, ctx: &Context, fid: u32, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write `data` at `offset`, returning how many bytes the server took
    async fn write(&self, ctx: &Context, fid: u32, offset: u64, data: &[u8]) -> Result<u32>;

    /// Open `fid` with `mode` (see [`om`]), returning its qid and iounit
    async fn open(&self, ctx: &Context, fid: u32, mode: u8) -> Result<(QId, u32)>;

    /// Create `name` in the directory `fid`, which then refers to the new file
    async fn create(
        &self,
        ctx: &Context,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(QId, u32)>;

    async fn stat(&self, ctx: &Context, fid: u32) -> Result<Dir>;

    /// Apply the fields of `stat` that are not "don't touch" (see [`Dir::unchanged`])
    async fn wstat(&self, ctx: &Context, fid: u32, stat: Dir) -> Result<()>;
}

fn unexpected(expected: MsgType, got: &FCall) -> Error {
    Error::UnexpectedResponse {
        expected,
        got: MsgType::from(got),
    }
}

#[async_trait]
impl Session for Client {
    async fn version(&self, ctx: &Context, msize: u32, version: &str) -> Result<(u32, String)> {
        let request_version = version;
        let request = FCall::TVersion {
            msize,
            version: version.to_owned(),
        };
        match self.rpc(ctx, request).await? {
            FCall::RVersion {
                msize: server_msize,
                version,
            } => {
                if version == VERSION_UNKNOWN {
                    return Err(Error::Protocol(format!(
                        "server does not speak {}",
                        request_version
                    )));
                }
                if server_msize > msize {
                    return Err(Error::Protocol(format!(
                        "server msize {} exceeds offered {}",
                        server_msize, msize
                    )));
                }
                debug!("negotiated {} with msize {}", version, server_msize);
                self.negotiated(server_msize);
                Ok((server_msize, version))
            }
            other => Err(unexpected(MsgType::RVersion, &other)),
        }
    }

    async fn auth(&self, ctx: &Context, afid: u32, uname: &str, aname: &str) -> Result<QId> {
        let request = FCall::TAuth {
            afid,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.rpc(ctx, request).await? {
            FCall::RAuth { aqid } => Ok(aqid),
            other => Err(unexpected(MsgType::RAuth, &other)),
        }
    }

    async fn attach(
        &self,
        ctx: &Context,
        fid: u32,
        afid: u32,
        uname: &str,
        aname: &str,
    ) -> Result<QId> {
        let request = FCall::TAttach {
            fid,
            afid,
            uname: uname.to_owned(),
            aname: aname.to_owned(),
        };
        match self.rpc(ctx, request).await? {
            FCall::RAttach { qid } => Ok(qid),
            other => Err(unexpected(MsgType::RAttach, &other)),
        }
    }

    async fn clunk(&self, ctx: &Context, fid: u32) -> Result<()> {
        self.rpc(ctx, FCall::TClunk { fid }).await.map(|_| ())
    }

    async fn remove(&self, ctx: &Context, fid: u32) -> Result<()> {
        self.rpc(ctx, FCall::TRemove { fid }).await.map(|_| ())
    }

    async fn walk(&self, ctx: &Context, fid: u32, newfid: u32, wnames: &[&str]) -> Result<Vec<QId>> {
        if wnames.len() > MAXWELEM {
            return Err(Error::Protocol(format!(
                "walk of {} elements exceeds {}",
                wnames.len(),
                MAXWELEM
            )));
        }

        let request = FCall::TWalk {
            fid,
            newfid,
            wnames: wnames.iter().map(|s| s.to_string()).collect(),
        };
        match self.rpc(ctx, request).await? {
            FCall::RWalk { wqids } if wqids.len() > wnames.len() => Err(Error::Protocol(format!(
                "walk of {} names returned {} qids",
                wnames.len(),
                wqids.len()
            ))),
            FCall::RWalk { wqids } => Ok(wqids),
            other => Err(unexpected(MsgType::RWalk, &other)),
        }
    }

    async fn read(&self, ctx: &Context, fid: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let count = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let request = FCall::TRead { fid, offset, count };
        match self.rpc(ctx, request).await? {
            FCall::RRead { data: Data(data) } => {
                if data.len() > buf.len() {
                    return Err(Error::Protocol(format!(
                        "read of {} bytes returned {}",
                        buf.len(),
                        data.len()
                    )));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            other => Err(unexpected(MsgType::RRead, &other)),
        }
    }

    async fn write(&self, ctx: &Context, fid: u32, offset: u64, data: &[u8]) -> Result<u32> {
        let request = FCall::TWrite {
            fid,
            offset,
            data: Data(data.to_vec()),
        };
        match self.rpc(ctx, request).await? {
            FCall::RWrite { count } => Ok(count),
            other => Err(unexpected(MsgType::RWrite, &other)),
        }
    }

    async fn open(&self, ctx: &Context, fid: u32, mode: u8) -> Result<(QId, u32)> {
        match self.rpc(ctx, FCall::TOpen { fid, mode }).await? {
            FCall::ROpen { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::ROpen, &other)),
        }
    }

    async fn create(
        &self,
        ctx: &Context,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<(QId, u32)> {
        let request = FCall::TCreate {
            fid,
            name: name.to_owned(),
            perm,
            mode,
        };
        match self.rpc(ctx, request).await? {
            FCall::RCreate { qid, iounit } => Ok((qid, iounit)),
            other => Err(unexpected(MsgType::RCreate, &other)),
        }
    }

    async fn stat(&self, ctx: &Context, fid: u32) -> Result<Dir> {
        match self.rpc(ctx, FCall::TStat { fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            other => Err(unexpected(MsgType::RStat, &other)),
        }
    }

    async fn wstat(&self, ctx: &Context, fid: u32, stat: Dir) -> Result<()> {
        self.rpc(ctx, FCall::TWStat { fid, stat }).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::Config,
            testing::{WAIT, pair},
        },
        tokio::time::timeout,
    };

    fn qid(path: u64) -> QId {
        QId {
            typ: QIdType::FILE,
            version: 0,
            path,
        }
    }

    #[tokio::test]
    async fn version_round_trip() {
        let (client, mut peer) = pair(Config::default());
        let ctx = Context::background();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.version(&ctx, 8192, P92000).await })
        };
        let req = peer
            .answer(|_| FCall::RVersion {
                msize: 4096,
                version: P92000.to_owned(),
            })
            .await;

        assert_eq!(req.tag, NOTAG);
        assert_eq!(
            req.body,
            FCall::TVersion {
                msize: 8192,
                version: "9P2000".to_owned()
            }
        );
        let negotiated = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(negotiated, (4096, "9P2000".to_owned()));
        assert_eq!(client.msize(), 4096);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn requests_are_held_to_the_negotiated_msize() {
        let (client, mut peer) = pair(Config::default());
        assert_eq!(client.msize(), 8192);

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.version(&Context::background(), 8192, P92000).await })
        };
        peer.answer(|_| FCall::RVersion {
            msize: 4096,
            version: P92000.to_owned(),
        })
        .await;
        timeout(WAIT, call).await.unwrap().unwrap().unwrap();

        // Fits the configured msize but not the negotiated one
        let outcome = client
            .write(&Context::background(), 1, 0, &[0u8; 5000])
            .await;
        assert!(matches!(
            outcome,
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::InvalidInput
        ));
        assert_eq!(client.in_flight(), 0);

        // Nothing reached the wire: the next frame the server sees is the clunk
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.clunk(&Context::background(), 1).await })
        };
        let req = peer.answer(|_| FCall::RClunk).await;
        assert_eq!(req.body, FCall::TClunk { fid: 1 });
        timeout(WAIT, call).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_version_is_refused() {
        let (client, mut peer) = pair(Config::default());

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.version(&Context::background(), 8192, "9P3000").await })
        };
        peer.answer(|_| FCall::RVersion {
            msize: 8192,
            version: VERSION_UNKNOWN.to_owned(),
        })
        .await;

        let outcome = timeout(WAIT, call).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn version_answered_with_wrong_kind() {
        let (client, mut peer) = pair(Config::default());
        let ctx = Context::background();

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.version(&ctx, 8192, P92000).await })
        };
        peer.answer(|_| FCall::RAttach { qid: qid(1) }).await;

        let outcome = timeout(WAIT, call).await.unwrap().unwrap();
        assert!(matches!(
            outcome,
            Err(Error::UnexpectedResponse {
                expected: MsgType::RVersion,
                got: MsgType::RAttach
            })
        ));
    }

    #[tokio::test]
    async fn walk_then_read_and_stat() {
        let (client, mut peer) = pair(Config::default());

        let session = client.clone();
        let call = tokio::spawn(async move {
            let ctx = Context::background();
            let wqids = session.walk(&ctx, 0, 1, &["usr", "glenda"]).await?;
            let mut buf = [0u8; 16];
            let n = session.read(&ctx, 1, 0, &mut buf).await?;
            let stat = session.stat(&ctx, 1).await?;
            Ok::<_, Error>((wqids, buf[..n].to_vec(), stat))
        });

        let walk = peer
            .answer(|_| FCall::RWalk {
                wqids: vec![qid(1), qid(2)],
            })
            .await;
        assert_eq!(
            walk.body,
            FCall::TWalk {
                fid: 0,
                newfid: 1,
                wnames: vec!["usr".to_owned(), "glenda".to_owned()]
            }
        );

        let read = peer
            .answer(|_| FCall::RRead {
                data: Data(b"hello".to_vec()),
            })
            .await;
        assert_eq!(
            read.body,
            FCall::TRead {
                fid: 1,
                offset: 0,
                count: 16
            }
        );

        let dir = Dir {
            qid: qid(2),
            name: "glenda".to_owned(),
            length: 5,
            ..Default::default()
        };
        let reply = dir.clone();
        peer.answer(move |_| FCall::RStat { stat: reply }).await;

        let (wqids, data, stat) = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(wqids, vec![qid(1), qid(2)]);
        assert_eq!(data, b"hello");
        assert_eq!(stat, dir);
    }

    #[tokio::test]
    async fn oversized_read_reply_is_rejected() {
        let (client, mut peer) = pair(Config::default());

        let call = tokio::spawn(async move {
            let mut buf = [0u8; 2];
            client.read(&Context::background(), 1, 0, &mut buf).await
        });
        peer.answer(|_| FCall::RRead {
            data: Data(b"too long".to_vec()),
        })
        .await;

        let outcome = timeout(WAIT, call).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn error_reply_becomes_remote_error() {
        let (client, mut peer) = pair(Config::default());

        let call = tokio::spawn(async move {
            client
                .attach(&Context::background(), 0, NOFID, "glenda", "")
                .await
        });
        peer.answer(|_| FCall::RError {
            ename: "permission denied".to_owned(),
        })
        .await;

        let outcome = timeout(WAIT, call).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(Error::Remote(ref e)) if e == "permission denied"));
    }
}
