//! Integration tests for the FUSE front end
//!
//! These tests drive the handle table the way the kernel would on behalf of
//! a helper, without requiring actual FUSE mounting (which requires
//! privileges).

#![cfg(feature = "fuse")]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::config::MountConfig;
use common::helper::{parse_request_path, DirectoryMirror, RequestHandler};
use common::mount::Mount;
use lazyfs_daemon::fuse::{entry_ttl, HandleTable, LazyFs, DEFAULT_TTL};
use tempfile::TempDir;

fn setup_origin() -> TempDir {
    let origin = TempDir::new().unwrap();
    std::fs::write(origin.path().join("hello"), b"Hello").unwrap();
    std::fs::create_dir(origin.path().join("docs")).unwrap();
    std::fs::write(origin.path().join("docs").join("readme"), b"read me").unwrap();
    std::fs::create_dir(origin.path().join("dyn")).unwrap();
    std::fs::create_dir(origin.path().join("dyn").join("dir")).unwrap();
    origin
}

fn setup_mount() -> (Arc<Mount>, TempDir) {
    let cache = TempDir::new().unwrap();
    let mount = Arc::new(Mount::new(MountConfig::new(cache.path())).unwrap());
    (mount, cache)
}

/// Answer requests through control and request handles until detached.
/// Returns the paths seen.
fn spawn_file_helper(
    mount: &Arc<Mount>,
    handles: &Arc<HandleTable>,
    origin: &TempDir,
) -> (u64, thread::JoinHandle<Vec<String>>) {
    let control_fh = handles.attach_control(mount).unwrap();
    let channel = handles.control(control_fh).unwrap();
    let mount = mount.clone();
    let handles = handles.clone();
    let mut mirror = DirectoryMirror::new(origin.path()).with_dynamic("/dyn");

    let thread = thread::spawn(move || {
        let mut seen = Vec::new();
        loop {
            // "<id> " on the control file, nothing once detached
            let announced = String::from_utf8(handles.read_control(&channel).unwrap()).unwrap();
            if announced.is_empty() {
                break;
            }
            let id: u64 = announced.trim_end().parse().unwrap();

            let fh = handles.open_request(id).unwrap();
            let bytes = handles.read_request(fh).unwrap();
            let vpath = parse_request_path(&bytes).unwrap();
            assert!(handles.read_request(fh).unwrap().is_empty());

            let _ = mirror.handle(mount.store(), &vpath);
            seen.push(vpath);
            handles.release_request(fh);
        }
        seen
    });
    (control_fh, thread)
}

#[test]
fn test_helper_through_handles() {
    let origin = setup_origin();
    let (mount, _cache) = setup_mount();
    let handles = Arc::new(HandleTable::new());
    let (control_fh, helper) = spawn_file_helper(&mount, &handles, &origin);

    let file = mount.open("/docs/readme").unwrap();
    let (fh, keep_cache) = handles.insert_file(file);
    assert!(!keep_cache);
    assert_eq!(handles.file(fh).unwrap().read(0, 4).unwrap(), b"read");
    handles.release_file(fh);

    assert!(handles.release_control(control_fh));
    let seen = helper.join().unwrap();
    assert_eq!(seen, vec!["/", "/docs", "/docs/readme"]);
    assert!(!handles.control_attached());
}

#[test]
fn test_second_control_open_is_busy() {
    let (mount, _cache) = setup_mount();
    let handles = HandleTable::new();
    let fh = handles.attach_control(&mount).unwrap();

    let err = handles.attach_control(&mount).unwrap_err();
    assert_eq!(err.errno(), libc::EBUSY);

    handles.release_control(fh);
    assert!(handles.attach_control(&mount).is_ok());
}

#[test]
fn test_missing_path_is_enoent() {
    let origin = setup_origin();
    let (mount, _cache) = setup_mount();
    let handles = Arc::new(HandleTable::new());
    let (control_fh, helper) = spawn_file_helper(&mount, &handles, &origin);

    let err = mount.open("/nope").unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);

    handles.release_control(control_fh);
    helper.join().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_filesystem_inside_runtime() {
    let (mount, _cache) = setup_mount();
    let fs = LazyFs::new(mount, DEFAULT_TTL).unwrap();
    assert_eq!(fs.handles().open_files(), 0);
    assert!(!fs.handles().control_attached());
}

#[test]
fn test_one_request_per_dynamic_listing() {
    let origin = setup_origin();
    let (mount, _cache) = setup_mount();
    let handles = Arc::new(HandleTable::new());
    let (control_fh, helper) = spawn_file_helper(&mount, &handles, &origin);

    mount.lookup("/dyn/dir").unwrap();
    let dyn_ino = mount.lookup("/dyn").unwrap().id;
    for _ in 0..3 {
        // opendir, readdir at 0, readdir at the end, releasedir
        let fh = handles.open_dir(&mount, dyn_ino, "/dyn").unwrap();
        let page = handles.dir_page(fh, 0).unwrap();
        let end = page.last().unwrap().0;
        assert!(handles.dir_page(fh, end).unwrap().is_empty());
        handles.release_dir(fh);
    }

    handles.release_control(control_fh);
    let seen = helper.join().unwrap();
    assert_eq!(seen.iter().filter(|p| *p == "/dyn").count(), 4);
}

#[test]
fn test_dynamic_children_bypass_kernel_cache() {
    let origin = setup_origin();
    let (mount, cache) = setup_mount();
    let handles = Arc::new(HandleTable::new());
    let (control_fh, helper) = spawn_file_helper(&mount, &handles, &origin);

    let hello = mount.lookup("/hello").unwrap();
    assert_eq!(entry_ttl(DEFAULT_TTL, &hello), DEFAULT_TTL);

    let dir = mount.lookup("/dyn/dir").unwrap();
    assert_eq!(entry_ttl(DEFAULT_TTL, &dir), Duration::ZERO);
    let dyn_dir = mount.lookup("/dyn").unwrap();
    assert_eq!(entry_ttl(DEFAULT_TTL, &dyn_dir), Duration::ZERO);

    // Gone from the cache and from the origin: the next lookup asks and fails
    std::fs::remove_dir(origin.path().join("dyn").join("dir")).unwrap();
    std::fs::remove_dir_all(cache.path().join("dyn").join("dir")).unwrap();
    assert!(mount.lookup("/dyn/dir").unwrap_err().is_not_found());

    handles.release_control(control_fh);
    let seen = helper.join().unwrap();
    assert_eq!(seen.iter().filter(|p| *p == "/dyn/dir").count(), 2);
}
