//! End-to-end transactional scenarios driven through the public API.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use basalt::{
    BufferPool, Catalog, DbError, HeapFile, PageId, PageStore, Permissions, TransactionManager,
};

const TABLE: basalt::TableId = 1;

fn setup(num_pages: usize) -> (tempfile::TempDir, Arc<BufferPool>, TransactionManager, Arc<HeapFile>) {
    let dir = tempfile::TempDir::new().unwrap();
    let catalog = Arc::new(Catalog::new());
    let file = Arc::new(HeapFile::open(TABLE, dir.path().join("table.db")).unwrap());
    catalog.register_file(TABLE, Arc::clone(&file) as Arc<dyn PageStore>);
    let pool = Arc::new(BufferPool::new(num_pages, catalog));
    (dir, pool, TransactionManager::new(), file)
}

fn pid(no: u32) -> PageId {
    PageId::new(TABLE, no)
}

#[test]
fn two_readers_share_a_page() {
    let (_dir, pool, tm, _file) = setup(2);
    let a = tm.begin();
    let b = tm.begin();

    let page_a = pool.get_page(a, pid(0), Permissions::ReadOnly).unwrap();
    let page_b = pool.get_page(b, pid(0), Permissions::ReadOnly).unwrap();
    assert!(Arc::ptr_eq(&page_a, &page_b));
    assert!(pool.holds_lock(a, pid(0)));
    assert!(pool.holds_lock(b, pid(0)));
}

#[test]
fn a_reader_blocks_behind_a_writer_and_sees_its_commit() {
    let (_dir, pool, tm, file) = setup(2);
    let writer = tm.begin();
    let reader = tm.begin();

    let page = pool
        .get_page(writer, pid(0), Permissions::ReadWrite)
        .unwrap();
    page.data_mut()[..7].copy_from_slice(b"deposit");
    page.mark_dirty(Some(writer));

    let (read_tx, read_rx) = mpsc::channel();
    let reading = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let page = pool.get_page(reader, pid(0), Permissions::ReadOnly).unwrap();
            read_tx.send(page.data()[..7].to_vec()).unwrap();
        })
    };

    // The reader must stay parked while the writer holds the page.
    assert!(read_rx.recv_timeout(Duration::from_millis(150)).is_err());

    pool.transaction_complete(writer, true).unwrap();
    let seen = read_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    reading.join().unwrap();
    assert_eq!(&seen, b"deposit");

    let on_disk = file.read_page(pid(0)).unwrap();
    assert_eq!(&on_disk.data()[..7], b"deposit");
}

#[test]
fn crossed_writers_deadlock_and_exactly_one_commits() {
    let (_dir, pool, tm, file) = setup(4);
    let a = tm.begin();
    let b = tm.begin();

    let first = pool.get_page(a, pid(1), Permissions::ReadWrite).unwrap();
    first.data_mut()[0] = 0xaa;
    first.mark_dirty(Some(a));
    let second = pool.get_page(b, pid(2), Permissions::ReadWrite).unwrap();
    second.data_mut()[0] = 0xbb;
    second.mark_dirty(Some(b));

    let crossing = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || match pool.get_page(a, pid(2), Permissions::ReadWrite) {
            Ok(_) => {
                pool.transaction_complete(a, true).unwrap();
                false
            }
            Err(DbError::Aborted) => {
                pool.transaction_complete(a, false).unwrap();
                true
            }
            Err(err) => panic!("unexpected error: {err}"),
        })
    };

    thread::sleep(Duration::from_millis(150));
    let b_aborted = match pool.get_page(b, pid(1), Permissions::ReadWrite) {
        Ok(_) => {
            pool.transaction_complete(b, true).unwrap();
            false
        }
        Err(DbError::Aborted) => {
            pool.transaction_complete(b, false).unwrap();
            true
        }
        Err(err) => panic!("unexpected error: {err}"),
    };
    let a_aborted = crossing.join().unwrap();

    assert_ne!(a_aborted, b_aborted, "exactly one transaction must abort");

    // The survivor's write reached disk; the victim's never did.
    let survivor_page = if a_aborted { pid(2) } else { pid(1) };
    let survivor_byte = if a_aborted { 0xbb } else { 0xaa };
    assert_eq!(file.read_page(survivor_page).unwrap().data()[0], survivor_byte);
    let victim_page = if a_aborted { pid(1) } else { pid(2) };
    assert_eq!(file.read_page(victim_page).unwrap().data()[0], 0);
}

#[test]
fn a_sole_reader_upgrades_to_writer_in_place() {
    let (_dir, pool, tm, _file) = setup(2);
    let a = tm.begin();
    let b = tm.begin();

    pool.get_page(a, pid(0), Permissions::ReadOnly).unwrap();
    let page = pool.get_page(a, pid(0), Permissions::ReadWrite).unwrap();
    page.data_mut()[0] = 9;
    page.mark_dirty(Some(a));
    assert!(pool.holds_lock(a, pid(0)));

    // The upgraded lock is exclusive: a reader now blocks until commit.
    let (read_tx, read_rx) = mpsc::channel();
    let reading = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            pool.get_page(b, pid(0), Permissions::ReadOnly).unwrap();
            read_tx.send(()).unwrap();
        })
    };
    assert!(read_rx.recv_timeout(Duration::from_millis(150)).is_err());

    pool.transaction_complete(a, true).unwrap();
    read_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    reading.join().unwrap();
}

#[test]
fn an_aborted_transaction_leaves_no_trace() {
    let (_dir, pool, tm, _file) = setup(2);

    let writer = tm.begin();
    let page = pool
        .get_page(writer, pid(0), Permissions::ReadWrite)
        .unwrap();
    page.data_mut()[..5].copy_from_slice(b"saved");
    page.mark_dirty(Some(writer));
    pool.transaction_complete(writer, true).unwrap();
    tm.finished(writer);

    let aborter = tm.begin();
    let page = pool
        .get_page(aborter, pid(0), Permissions::ReadWrite)
        .unwrap();
    page.data_mut()[..5].copy_from_slice(b"draft");
    page.mark_dirty(Some(aborter));
    pool.transaction_complete(aborter, false).unwrap();
    tm.finished(aborter);

    let reader = tm.begin();
    let reread = pool
        .get_page(reader, pid(0), Permissions::ReadOnly)
        .unwrap();
    assert_eq!(&reread.data()[..5], b"saved");
}
