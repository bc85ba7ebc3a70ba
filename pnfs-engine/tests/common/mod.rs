//! Test utility functions: a loopback transport wiring an [`NfsClient`] to a
//! [`LayoutServer`] in the same process, an in-memory export and a callback
//! channel delivering CB_LAYOUTRECALL straight into the client.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
        Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use pnfs_engine::{
    client::{
        CbLayoutRecallArgs,
        FileHandle,
        LayoutCommitArgs,
        LayoutCommitReply,
        LayoutGetArgs,
        LayoutGetReply,
        LayoutReturnArgs,
        LayoutTransport,
        NfsClient,
        NfsInode,
        NfsMount,
    },
    core::{IoMode, LayoutRange, LayoutType, Nfs4Status, Stateid},
    deviceid::DeviceId,
    driver::{BlockExtentDesc, DeviceAddr, ExtentState, LayoutBody, LayoutDriverRegistry},
    logger,
    server::{
        make_device_id,
        CallbackChannel,
        ClientId,
        ExportOps,
        FileKey,
        LayoutGrant,
        LayoutServer,
        ReturnReason,
        SbidTable,
        ServerError,
    },
    subsys::config::{ClientOpts, DeviceCacheOpts, ServerOpts},
};

/// Superblock of the export most tests use.
pub const SB: u64 = 0x5eed;

/// Bytes granted for a LAYOUTGET asking for "to the end of the file".
pub const GRANT_CHUNK: u64 = 1 << 20;

/// GETDEVICEINFO maxcount the loopback transport sends.
pub const MAXCOUNT: u32 = 4096;

/// Hook run by a mock before it does its work.
pub type Hook = Box<dyn FnOnce() + Send>;

static LOGGER: OnceCell<()> = OnceCell::new();

/// Configures logging once per test binary.
pub fn test_init() {
    LOGGER.get_or_init(|| {
        if let Err(error) = logger::init("info,pnfs_engine=debug") {
            eprintln!("logger already set up: {error}");
        }
    });
}

/// call F cnt times, and sleep for a duration between each invocation
pub fn retry<F>(mut cnt: u32, timeout: Duration, mut f: F)
where
    F: FnMut() -> bool,
{
    loop {
        if f() {
            return;
        }
        cnt -= 1;
        if cnt == 0 {
            break;
        }
        std::thread::sleep(timeout);
    }
    panic!("condition not reached with retries");
}

pub fn fast_server_opts() -> ServerOpts {
    ServerOpts {
        cb_recall_retries: 3,
        cb_retry_delay_ms: 1,
        max_layout_records: 1024,
    }
}

pub fn fast_client_opts() -> ClientOpts {
    ClientOpts {
        pnfs_enabled: true,
        max_cb_lrecalls: 8,
        recall_drain_timeout_ms: 5_000,
    }
}

pub fn new_server(opts: ServerOpts) -> Arc<LayoutServer> {
    Arc::new(LayoutServer::new(opts, Arc::new(SbidTable::new())))
}

pub fn range(iomode: IoMode, offset: u64, length: u64) -> LayoutRange {
    LayoutRange::new(iomode, offset, length)
}

/// In-memory filesystem handing out layouts of one type.
pub struct MockExport {
    layout_type: LayoutType,
    roc: AtomicBool,
    size: AtomicU64,
    fail: Mutex<Option<Nfs4Status>>,
    hook: Mutex<Option<Hook>>,
    pub grants: AtomicUsize,
    pub returned: Mutex<Vec<(FileKey, LayoutRange, ReturnReason)>>,
    pub commits: Mutex<Vec<(FileKey, Option<u64>, Option<DateTime<Utc>>)>>,
}

impl MockExport {
    pub fn new(layout_type: LayoutType) -> Arc<Self> {
        Arc::new(Self {
            layout_type,
            roc: AtomicBool::new(false),
            size: AtomicU64::new(0),
            fail: Mutex::new(None),
            hook: Mutex::new(None),
            grants: AtomicUsize::new(0),
            returned: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
        })
    }

    pub fn set_roc(&self, roc: bool) {
        self.roc.store(roc, Ordering::SeqCst);
    }

    pub fn fail_with(&self, status: Option<Nfs4Status>) {
        *self.fail.lock() = status;
    }

    /// Runs `hook` inside the next layout_get, before the grant is made.
    pub fn on_next_get(&self, hook: Hook) {
        *self.hook.lock() = Some(hook);
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn returned(&self) -> Vec<(FileKey, LayoutRange, ReturnReason)> {
        self.returned.lock().clone()
    }

    fn body(&self, range: &LayoutRange, sbid: u64) -> LayoutBody {
        let deviceid = make_device_id(sbid, 0);
        match self.layout_type {
            LayoutType::Files => LayoutBody::Files {
                deviceid,
                stripe_unit: 64 * 1024,
                first_stripe_index: 0,
                pattern_offset: 0,
                commit_through_mds: false,
                filehandles: vec![vec![0xfe; 16]],
            },
            LayoutType::Blocks => LayoutBody::Blocks {
                extents: vec![BlockExtentDesc {
                    deviceid,
                    file_offset: range.offset,
                    length: range.length,
                    storage_offset: range.offset,
                    state: match range.iomode {
                        IoMode::Read => ExtentState::Read,
                        _ => ExtentState::Invalid,
                    },
                }],
            },
            LayoutType::Objects => unimplemented!("no objects export"),
        }
    }
}

impl ExportOps for MockExport {
    fn layout_type(&self) -> LayoutType {
        self.layout_type
    }

    fn layout_get(
        &self,
        _file: &FileKey,
        range: &LayoutRange,
        sbid: u64,
    ) -> Result<LayoutGrant, Nfs4Status> {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        if let Some(status) = *self.fail.lock() {
            return Err(status);
        }

        let granted = if range.length == u64::MAX {
            LayoutRange::new(range.iomode, range.offset, GRANT_CHUNK)
        } else {
            *range
        };
        self.grants.fetch_add(1, Ordering::SeqCst);
        Ok(LayoutGrant {
            range: granted,
            return_on_close: self.roc.load(Ordering::SeqCst),
            body: self.body(&granted, sbid),
        })
    }

    fn layout_commit(
        &self,
        file: &FileKey,
        new_size: Option<u64>,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<Option<u64>, Nfs4Status> {
        self.commits.lock().push((*file, new_size, mtime));
        match new_size {
            Some(size) if size > self.size() => {
                self.size.store(size, Ordering::SeqCst);
                Ok(Some(size))
            }
            _ => Ok(None),
        }
    }

    fn layout_return(
        &self,
        file: &FileKey,
        range: &LayoutRange,
        reason: ReturnReason,
    ) {
        self.returned.lock().push((*file, *range, reason));
    }

    fn get_device_info(&self, index: u64) -> Result<DeviceAddr, Nfs4Status> {
        if index != 0 {
            return Err(Nfs4Status::NoEnt);
        }
        Ok(match self.layout_type {
            LayoutType::Files => DeviceAddr::Files {
                stripe_indices: vec![0, 1],
                data_servers: vec![
                    vec!["10.0.0.1:2049".to_string()],
                    vec!["10.0.0.2:2049".to_string()],
                ],
            },
            LayoutType::Blocks => DeviceAddr::Blocks {
                signature: b"pnfs-vol".to_vec(),
                sector_count: 1 << 30,
            },
            LayoutType::Objects => DeviceAddr::Objects {
                osd_name: "osd0".to_string(),
                address: "10.0.0.3:3260".to_string(),
            },
        })
    }
}

/// Forechannel of a test client: every call goes straight to the server.
pub struct LoopbackTransport {
    server: Arc<LayoutServer>,
    client: ClientId,
    hook: Mutex<Option<Hook>>,
    pub layoutgets: AtomicUsize,
    pub layoutreturns: Mutex<Vec<LayoutReturnArgs>>,
    pub getdeviceinfos: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(server: &Arc<LayoutServer>, client: ClientId) -> Arc<Self> {
        Arc::new(Self {
            server: server.clone(),
            client,
            hook: Mutex::new(None),
            layoutgets: AtomicUsize::new(0),
            layoutreturns: Mutex::new(Vec::new()),
            getdeviceinfos: AtomicUsize::new(0),
        })
    }

    /// Runs `hook` after the server answered the next LAYOUTGET and before
    /// the client sees the reply.
    pub fn on_next_reply(&self, hook: Hook) {
        *self.hook.lock() = Some(hook);
    }
}

impl LayoutTransport for LoopbackTransport {
    fn layoutget(
        &self,
        args: &LayoutGetArgs,
    ) -> Result<LayoutGetReply, Nfs4Status> {
        self.layoutgets.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .server
            .layout_get(self.client, args)
            .map_err(|e| e.status());
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        reply
    }

    fn layoutreturn(
        &self,
        args: &LayoutReturnArgs,
    ) -> Result<Option<Stateid>, Nfs4Status> {
        self.layoutreturns.lock().push(args.clone());
        self.server
            .layout_return(self.client, args)
            .map_err(|e| e.status())
    }

    fn layoutcommit(
        &self,
        args: &LayoutCommitArgs,
    ) -> Result<LayoutCommitReply, Nfs4Status> {
        self.server
            .layout_commit(self.client, args)
            .map_err(|e| e.status())
    }

    fn getdeviceinfo(
        &self,
        layout_type: LayoutType,
        id: &DeviceId,
    ) -> Result<DeviceAddr, Nfs4Status> {
        self.getdeviceinfos.fetch_add(1, Ordering::SeqCst);
        self.server
            .get_device_info(layout_type, id, MAXCOUNT)
            .map_err(|e| e.status())
    }
}

/// Backchannel of a test client. Calls reach the client unless an answer
/// was queued or the channel is broken.
pub struct ClientCallback {
    client: OnceCell<Weak<NfsClient>>,
    broken: AtomicBool,
    answer: Mutex<Vec<Nfs4Status>>,
    pub calls: Mutex<Vec<CbLayoutRecallArgs>>,
}

impl ClientCallback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client: OnceCell::new(),
            broken: AtomicBool::new(false),
            answer: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn attach(&self, client: &Arc<NfsClient>) {
        if self.client.set(Arc::downgrade(client)).is_err() {
            panic!("callback already attached");
        }
    }

    /// Every call fails at the transport level.
    pub fn break_channel(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// The next calls are answered with `statuses`, in order, without
    /// reaching the client.
    pub fn answer_with(&self, statuses: &[Nfs4Status]) {
        let mut answer = self.answer.lock();
        answer.clear();
        answer.extend(statuses.iter().rev());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl CallbackChannel for ClientCallback {
    fn cb_layoutrecall(
        &self,
        args: &CbLayoutRecallArgs,
    ) -> Result<Nfs4Status, ServerError> {
        self.calls.lock().push(args.clone());
        if self.broken.load(Ordering::SeqCst) {
            return Err(ServerError::Callback {
                client: 0,
                reason: "connection reset".to_string(),
            });
        }
        if let Some(status) = self.answer.lock().pop() {
            return Ok(status);
        }
        match self.client.get().and_then(Weak::upgrade) {
            Some(client) => Ok(client.cb_layoutrecall(args.clone())),
            None => Err(ServerError::Callback {
                client: 0,
                reason: "client gone".to_string(),
            }),
        }
    }
}

/// A client registered with a server, with one mount of [`SB`].
pub struct TestClient {
    pub id: ClientId,
    pub client: Arc<NfsClient>,
    pub transport: Arc<LoopbackTransport>,
    pub callback: Arc<ClientCallback>,
    pub mount: Arc<NfsMount>,
}

impl TestClient {
    pub fn new(server: &Arc<LayoutServer>, id: ClientId, layout_type: LayoutType) -> Self {
        Self::with_opts(server, id, layout_type, fast_client_opts())
    }

    pub fn with_opts(
        server: &Arc<LayoutServer>,
        id: ClientId,
        layout_type: LayoutType,
        opts: ClientOpts,
    ) -> Self {
        let callback = ClientCallback::new();
        server.register_client(id, callback.clone());

        let transport = LoopbackTransport::new(server, id);
        let client = NfsClient::new(
            &format!("client-{id}"),
            transport.clone(),
            Arc::new(LayoutDriverRegistry::with_defaults()),
            opts,
            DeviceCacheOpts::default(),
        );
        callback.attach(&client);

        let mount = NfsMount::new(&client, SB, &[layout_type as u32]).unwrap();
        Self {
            id,
            client,
            transport,
            callback,
            mount,
        }
    }

    /// Opens inode `ino` of the export, with a fresh open stateid.
    pub fn open(&self, ino: u64) -> Arc<NfsInode> {
        NfsInode::new(
            &self.mount,
            ino,
            FileKey::new(SB, ino).fh(),
            Stateid::generate(),
        )
    }

    pub fn fh(ino: u64) -> FileHandle {
        FileKey::new(SB, ino).fh()
    }

    /// Waits for the recall worker threads of the client.
    pub fn settle(&self) {
        self.client
            .wait_recalls_idle(Some(Duration::from_secs(10)))
            .unwrap();
    }
}

/// A server with one export of `layout_type` on [`SB`].
pub fn setup(layout_type: LayoutType) -> (Arc<LayoutServer>, Arc<MockExport>) {
    test_init();
    let server = new_server(fast_server_opts());
    let export = MockExport::new(layout_type);
    server.add_export(SB, export.clone());
    (server, export)
}
