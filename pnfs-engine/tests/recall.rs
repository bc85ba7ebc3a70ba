use std::{
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use assert_matches::assert_matches;
use futures::executor::block_on;
use parking_lot::Mutex;

use pnfs_engine::{
    client::{CbLayoutRecallArgs, LayoutError, LayoutGetArgs},
    core::{IoMode, LayoutType, Nfs4Status, ReturnType, Stateid},
    server::{FileKey, RecallCookie, RecallTarget, ReturnReason, ServerError},
};

pub mod common;
use common::{fast_client_opts, range, setup, TestClient, SB};

fn file_target(ino: u64, iomode: IoMode) -> RecallTarget {
    RecallTarget::file(
        LayoutType::Files,
        FileKey::new(SB, ino),
        range(iomode, 0, u64::MAX),
    )
}

fn get_args(ino: u64, iomode: IoMode, offset: u64, stateid: Stateid) -> LayoutGetArgs {
    LayoutGetArgs {
        fh: TestClient::fh(ino),
        layout_type: LayoutType::Files,
        range: range(iomode, offset, 4096),
        minlength: 4096,
        stateid,
    }
}

#[test]
fn file_recall_drains_and_returns() {
    let (server, export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(1);
    let file = FileKey::new(SB, 1);

    drop(inode.layoutget(&range(IoMode::ReadWrite, 0, 4096)).unwrap());
    let granted = server.layout_stateid(c.id, &file).unwrap();

    let cookie = server
        .recall_layout(file_target(1, IoMode::Any), None)
        .unwrap();
    assert_eq!(cookie.recalled(), 1);
    block_on(cookie);
    c.settle();

    assert_eq!(server.record_count(), 0);
    assert_eq!(server.pending_recalls(), 0);
    assert_eq!(c.client.pending_recalls(), 0);
    assert_eq!(inode.layout().unwrap().segment_count(), 0);
    assert!(c.client.layouts().is_empty());

    // the recall carried the next seqid of the layout state
    let calls = c.callback.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].return_type, ReturnType::File);
    let sent = calls[0].stateid.unwrap();
    assert!(sent.same_state(&granted));
    assert_eq!(sent.seqid, granted.seqid + 1);

    assert_eq!(c.transport.layoutreturns.lock().len(), 1);
    assert_eq!(export.returned()[0].2, ReturnReason::Returned);
}

#[test]
fn recall_waits_for_io_in_flight() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(2);

    let seg = inode.layoutget(&range(IoMode::ReadWrite, 0, 4096)).unwrap();
    let cookie = server
        .recall_layout(file_target(2, IoMode::ReadWrite), None)
        .unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert!(!seg.is_valid());
    assert_eq!(server.pending_recalls(), 1);
    assert_eq!(server.record_count(), 1);
    assert_eq!(c.client.pending_recalls(), 1);
    assert!(c.transport.layoutreturns.lock().is_empty());

    // no new layout while the recall drains, on either side
    assert_matches!(
        inode.layoutget(&range(IoMode::Read, 0, 10)),
        Err(LayoutError::Blocked { .. })
    );
    let sid = server.layout_stateid(c.id, &FileKey::new(SB, 2)).unwrap();
    let err = server
        .layout_get(c.id, &get_args(2, IoMode::ReadWrite, 0, sid))
        .unwrap_err();
    assert_matches!(err, ServerError::RecallConflict { .. });
    assert!(err.is_retryable());

    drop(seg);
    block_on(cookie);
    c.settle();
    assert_eq!(server.record_count(), 0);
    assert!(!inode.layout().unwrap().layoutgets_blocked());
}

#[test]
fn reply_behind_recall_barrier_is_forgotten() {
    let (server, export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(3);
    let file = FileKey::new(SB, 3);

    let recalled = Arc::new(Mutex::new(None));
    {
        let server = server.clone();
        let recalled = recalled.clone();
        c.transport.on_next_reply(Box::new(move || {
            let cookie = server
                .recall_layout(file_target(3, IoMode::Any), None)
                .unwrap();
            *recalled.lock() = Some(cookie.recalled());
            block_on(cookie);
        }));
    }

    assert_matches!(
        inode.layoutget(&range(IoMode::Read, 0, 4096)),
        Err(LayoutError::Forgotten { .. })
    );
    assert_eq!(*recalled.lock(), Some(1));

    // the client had nothing to return, the server revoked the grant
    let hdr = inode.layout().unwrap();
    assert_eq!(hdr.segment_count(), 0);
    assert!(!hdr.is_on_client_list());
    assert_eq!(server.record_count(), 0);
    assert_eq!(export.returned()[0].2, ReturnReason::Recalled);
    assert_eq!(hdr.stateid(), server.layout_stateid(c.id, &file));

    // later LAYOUTGETs are accepted again
    assert!(inode.layoutget(&range(IoMode::Read, 0, 4096)).is_ok());
    assert_eq!(hdr.segment_count(), 1);
    assert_eq!(hdr.stateid(), server.layout_stateid(c.id, &file));
}

#[test]
fn reply_during_pending_recall_is_forgotten() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(4);

    let held = inode.layoutget(&range(IoMode::Read, 1 << 20, 4096)).unwrap();

    let cookie: Arc<Mutex<Option<RecallCookie>>> = Arc::new(Mutex::new(None));
    {
        let server = server.clone();
        let cookie = cookie.clone();
        c.transport.on_next_reply(Box::new(move || {
            let recall = server
                .recall_layout(file_target(4, IoMode::Read), None)
                .unwrap();
            *cookie.lock() = Some(recall);
        }));
    }

    assert_matches!(
        inode.layoutget(&range(IoMode::Read, 0, 4096)),
        Err(LayoutError::Forgotten { .. })
    );
    let hdr = inode.layout().unwrap();
    assert_eq!(hdr.segment_count(), 0);
    assert_eq!(c.client.pending_recalls(), 1);

    // both the held and the forgotten grant go back with the return
    drop(held);
    let cookie = cookie.lock().take().unwrap();
    assert_eq!(cookie.recalled(), 1);
    block_on(cookie);
    c.settle();
    assert_eq!(server.record_count(), 0);
    assert_eq!(c.transport.layoutreturns.lock().len(), 1);
}

#[test]
fn bulk_recall_racing_layoutget_forgets_reply() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(7);

    let cookie: Arc<Mutex<Option<RecallCookie>>> = Arc::new(Mutex::new(None));
    {
        let server = server.clone();
        let cookie = cookie.clone();
        c.transport.on_next_reply(Box::new(move || {
            let recall = server
                .recall_layout(
                    RecallTarget::all(
                        LayoutType::Files,
                        range(IoMode::Any, 0, u64::MAX),
                    ),
                    None,
                )
                .unwrap();
            *cookie.lock() = Some(recall);
        }));
    }

    // the header has no segments yet, only the grant in flight
    assert_matches!(
        inode.layoutget(&range(IoMode::Read, 0, 4096)),
        Err(LayoutError::Forgotten { .. })
    );
    let hdr = inode.layout().unwrap();
    assert_eq!(hdr.segment_count(), 0);

    let cookie = cookie.lock().take().unwrap();
    assert_eq!(cookie.recalled(), 1);
    block_on(cookie);
    c.settle();
    assert_eq!(server.record_count(), 0);
    assert_eq!(c.client.pending_recalls(), 0);

    let returns = c.transport.layoutreturns.lock().clone();
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].return_type, ReturnType::All);
    assert!(!hdr.is_bulk_recall());
}

#[test]
fn bulk_recall_returns_everything() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let a = c.open(5);
    let b = c.open(6);

    drop(a.layoutget(&range(IoMode::Read, 0, 4096)).unwrap());
    let held = b.layoutget(&range(IoMode::ReadWrite, 0, 4096)).unwrap();
    assert_eq!(server.record_count(), 2);

    let cookie = server
        .recall_layout(
            RecallTarget::all(LayoutType::Files, range(IoMode::Any, 0, u64::MAX)),
            None,
        )
        .unwrap();
    assert_eq!(cookie.recalled(), 1);

    // a bulk recall is processed alone
    let hdr = b.layout().unwrap();
    assert!(hdr.is_bulk_recall());
    let status = c.client.cb_layoutrecall(CbLayoutRecallArgs {
        return_type: ReturnType::File,
        layout_type: LayoutType::Files,
        range: range(IoMode::Any, 0, u64::MAX),
        changed: false,
        fh: Some(TestClient::fh(5)),
        stateid: None,
        fsid: None,
    });
    assert_eq!(status, Nfs4Status::Delay);
    assert_matches!(
        b.layoutget(&range(IoMode::Read, 8192, 10)),
        Err(LayoutError::Blocked { .. })
    );

    drop(held);
    block_on(cookie);
    c.settle();

    assert_eq!(server.record_count(), 0);
    assert!(!hdr.is_bulk_recall());
    assert!(c.client.layouts().is_empty());
    let returns = c.transport.layoutreturns.lock().clone();
    assert_eq!(returns.len(), 1);
    assert_eq!(returns[0].return_type, ReturnType::All);
}

#[test]
fn fsid_recall_selects_by_filesystem() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(7);
    drop(inode.layoutget(&range(IoMode::Read, 0, 4096)).unwrap());

    let other = server
        .recall_layout(
            RecallTarget::fsid(LayoutType::Files, SB + 1, range(IoMode::Any, 0, u64::MAX)),
            None,
        )
        .unwrap();
    assert_eq!(other.recalled(), 0);
    block_on(other);
    assert_eq!(server.record_count(), 1);

    let cookie = server
        .recall_layout(
            RecallTarget::fsid(LayoutType::Files, SB, range(IoMode::Any, 0, u64::MAX)),
            None,
        )
        .unwrap();
    assert_eq!(cookie.recalled(), 1);
    block_on(cookie);
    c.settle();
    assert_eq!(server.record_count(), 0);
    let returns = c.transport.layoutreturns.lock().clone();
    assert_eq!(returns[0].return_type, ReturnType::Fsid);
    assert_eq!(returns[0].fsid, Some(SB));
}

#[test]
fn fan_out_completes_after_every_client() {
    let (server, _export) = setup(LayoutType::Files);
    let clients: Vec<TestClient> = (1 ..= 3)
        .map(|id| TestClient::new(&server, id, LayoutType::Files))
        .collect();

    let mut held = Vec::new();
    for c in &clients {
        let inode = c.open(8);
        held.push(inode.layoutget(&range(IoMode::Read, 0, 4096)).unwrap());
    }
    assert_eq!(server.record_count(), 3);

    let cookie = server
        .recall_layout(file_target(8, IoMode::Read), None)
        .unwrap();
    assert_eq!(cookie.recalled(), 3);
    assert_eq!(server.pending_recalls(), 3);

    // clients return one after the other
    let mut seg = held.pop();
    while let Some(s) = seg {
        drop(s);
        common::retry(200, Duration::from_millis(5), || {
            server.record_count() == held.len()
        });
        seg = held.pop();
    }

    block_on(cookie);
    for c in &clients {
        c.settle();
    }
    assert_eq!(server.pending_recalls(), 0);
}

#[test]
fn recall_of_one_client_leaves_others() {
    let (server, _export) = setup(LayoutType::Files);
    let c1 = TestClient::new(&server, 1, LayoutType::Files);
    let c2 = TestClient::new(&server, 2, LayoutType::Files);
    let file = FileKey::new(SB, 9);

    drop(c1.open(9).layoutget(&range(IoMode::Read, 0, 4096)).unwrap());
    drop(c2.open(9).layoutget(&range(IoMode::Read, 0, 4096)).unwrap());

    let cookie = server
        .recall_layout(file_target(9, IoMode::Any), Some(c2.id))
        .unwrap();
    assert_eq!(cookie.recalled(), 1);
    block_on(cookie);
    c2.settle();

    assert_eq!(server.layouts(c1.id, &file).len(), 1);
    assert!(server.layouts(c2.id, &file).is_empty());
    assert_eq!(c1.callback.call_count(), 0);
}

#[test]
fn client_without_callback_is_skipped() {
    let (server, _export) = setup(LayoutType::Files);
    let c1 = TestClient::new(&server, 1, LayoutType::Files);
    let c2 = TestClient::new(&server, 2, LayoutType::Files);
    let file = FileKey::new(SB, 10);

    drop(c1.open(10).layoutget(&range(IoMode::Read, 0, 4096)).unwrap());
    drop(c2.open(10).layoutget(&range(IoMode::Read, 0, 4096)).unwrap());
    server.set_callback_up(c2.id, false).unwrap();

    let cookie = server
        .recall_layout(file_target(10, IoMode::Any), None)
        .unwrap();
    assert_eq!(cookie.recalled(), 1);
    block_on(cookie);
    c1.settle();

    assert!(server.layouts(c1.id, &file).is_empty());
    assert_eq!(server.layouts(c2.id, &file).len(), 1);
    assert_eq!(c2.callback.call_count(), 0);

    assert_matches!(
        server.set_callback_up(99, true),
        Err(ServerError::UnknownClient { client: 99 })
    );
}

#[test]
fn broken_callback_revokes_layouts() {
    let (server, export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    drop(c.open(11).layoutget(&range(IoMode::Read, 0, 4096)).unwrap());

    c.callback.break_channel();
    let cookie = server
        .recall_layout(file_target(11, IoMode::Any), None)
        .unwrap();
    block_on(cookie);

    assert!(!server.callback_up(c.id));
    assert_eq!(server.record_count(), 0);
    assert_eq!(server.pending_recalls(), 0);
    assert_eq!(export.returned()[0].2, ReturnReason::Recalled);
    assert_eq!(c.callback.call_count(), 1);
}

#[test]
fn delayed_recall_is_retried() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    drop(c.open(12).layoutget(&range(IoMode::Read, 0, 4096)).unwrap());

    c.callback
        .answer_with(&[Nfs4Status::Delay, Nfs4Status::Delay]);
    let cookie = server
        .recall_layout(file_target(12, IoMode::Any), None)
        .unwrap();
    block_on(cookie);
    c.settle();

    // the third attempt reached the client, which returned the layout
    assert_eq!(c.callback.call_count(), 3);
    assert_eq!(c.transport.layoutreturns.lock().len(), 1);
    assert_eq!(server.record_count(), 0);
}

#[test]
fn endless_delay_revokes() {
    let (server, export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    drop(c.open(13).layoutget(&range(IoMode::Read, 0, 4096)).unwrap());

    c.callback.answer_with(&[Nfs4Status::Delay; 4]);
    let cookie = server
        .recall_layout(file_target(13, IoMode::Any), None)
        .unwrap();
    block_on(cookie);

    assert_eq!(c.callback.call_count(), 4);
    assert!(c.transport.layoutreturns.lock().is_empty());
    assert_eq!(server.record_count(), 0);
    assert_eq!(export.returned()[0].2, ReturnReason::Recalled);
    // the channel itself works
    assert!(server.callback_up(c.id));
}

#[test]
fn no_matching_layout_completes_recall() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(14);
    drop(inode.layoutget(&range(IoMode::Read, 0, 4096)).unwrap());

    // the client forgot the layout on its own
    inode.layout().unwrap().invalidate_matching(&range(IoMode::Any, 0, u64::MAX));

    let cookie = server
        .recall_layout(file_target(14, IoMode::Any), None)
        .unwrap();
    block_on(cookie);
    c.settle();

    assert_eq!(c.callback.call_count(), 1);
    assert!(c.transport.layoutreturns.lock().is_empty());
    assert_eq!(server.record_count(), 0);
}

#[test]
fn expiry_releases_recall_waiters() {
    let (server, export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let inode = c.open(15);
    drop(inode.layoutget(&range(IoMode::Read, 0, 4096)).unwrap());
    drop(inode.layoutget(&range(IoMode::ReadWrite, 1 << 20, 4096)).unwrap());

    // accepted, but the client never returns
    c.callback.answer_with(&[Nfs4Status::Ok]);
    let cookie = server
        .recall_layout(file_target(15, IoMode::Read), None)
        .unwrap();
    assert_eq!(server.pending_recalls(), 1);

    assert_eq!(server.expire_client(c.id), 2);
    block_on(cookie);
    assert_eq!(server.pending_recalls(), 0);
    assert_eq!(server.record_count(), 0);
    assert_eq!(server.layout_stateid(c.id, &FileKey::new(SB, 15)), None);
    assert!(export
        .returned()
        .iter()
        .all(|(_, _, reason)| *reason == ReturnReason::Expired));

    let err = inode.layoutget(&range(IoMode::Read, 1 << 21, 10)).unwrap_err();
    assert_eq!(err.status(), Nfs4Status::Expired);
}

#[test]
fn client_bounds_concurrent_recalls() {
    let (server, _export) = setup(LayoutType::Files);
    let mut opts = fast_client_opts();
    opts.max_cb_lrecalls = 1;
    let c = TestClient::with_opts(&server, 1, LayoutType::Files, opts);

    let a = c.open(16);
    let b = c.open(17);
    let held = a.layoutget(&range(IoMode::Read, 0, 4096)).unwrap();
    drop(b.layoutget(&range(IoMode::Read, 0, 4096)).unwrap());

    let first = server
        .recall_layout(file_target(16, IoMode::Any), None)
        .unwrap();
    assert_eq!(c.client.pending_recalls(), 1);

    let status = c.client.cb_layoutrecall(CbLayoutRecallArgs {
        return_type: ReturnType::File,
        layout_type: LayoutType::Files,
        range: range(IoMode::Any, 0, u64::MAX),
        changed: false,
        fh: Some(TestClient::fh(17)),
        stateid: None,
        fsid: None,
    });
    assert_eq!(status, Nfs4Status::Delay);
    assert_eq!(b.layout().unwrap().segment_count(), 1);

    drop(held);
    block_on(first);
    c.settle();
    assert_eq!(c.client.pending_recalls(), 0);
}

#[test]
fn recall_for_unknown_file_on_client() {
    let (server, _export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);

    let status = c.client.cb_layoutrecall(CbLayoutRecallArgs {
        return_type: ReturnType::File,
        layout_type: LayoutType::Files,
        range: range(IoMode::Any, 0, u64::MAX),
        changed: false,
        fh: Some(TestClient::fh(18)),
        stateid: None,
        fsid: None,
    });
    assert_eq!(status, Nfs4Status::NoMatchingLayout);
    assert_eq!(c.client.pending_recalls(), 0);
}

#[test]
fn grant_racing_recall_goes_back_to_export() {
    let (server, export) = setup(LayoutType::Files);
    let c = TestClient::new(&server, 1, LayoutType::Files);
    let file = FileKey::new(SB, 19);
    drop(c.open(19).layoutget(&range(IoMode::Read, 1 << 20, 4096)).unwrap());
    let sid = server.layout_stateid(c.id, &file).unwrap();

    c.callback.answer_with(&[Nfs4Status::Ok]);
    let cookie = Arc::new(Mutex::new(None));
    {
        let server = server.clone();
        let cookie = cookie.clone();
        export.on_next_get(Box::new(move || {
            let recall = server
                .recall_layout(file_target(19, IoMode::Read), None)
                .unwrap();
            *cookie.lock() = Some(recall);
        }));
    }

    let err = server
        .layout_get(c.id, &get_args(19, IoMode::Read, 0, sid))
        .unwrap_err();
    assert_matches!(err, ServerError::RecallConflict { .. });
    assert_eq!(server.layouts(c.id, &file).len(), 1);
    assert_eq!(export.returned().len(), 1);
    assert_eq!(export.returned()[0].1, range(IoMode::Read, 0, 4096));
    assert!(cookie.lock().is_some());
    assert_eq!(export.grants.load(Ordering::SeqCst), 2);
}

#[test]
fn malformed_recall_is_rejected() {
    let (server, _export) = setup(LayoutType::Files);
    let target = RecallTarget {
        return_type: ReturnType::File,
        layout_type: LayoutType::Files,
        range: range(IoMode::Any, 0, u64::MAX),
        file: None,
        fsid: None,
    };
    let err = server.recall_layout(target, None).unwrap_err();
    assert_matches!(err, ServerError::BadRecall { .. });
    assert_eq!(err.status(), Nfs4Status::Inval);
}
