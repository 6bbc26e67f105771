//! End-to-end workload scenarios.

use flog_core::Geometry;
use flog_harness::{block_is_unallocated, pattern, TestFs};
use std::collections::BTreeMap;

fn big_geo() -> Geometry {
    Geometry::new(512, 4, 4, 48).expect("geometry")
}

fn verify_model(t: &TestFs, model: &BTreeMap<String, Vec<u8>>) {
    let mut listed: Vec<String> = t
        .fs
        .list()
        .expect("list")
        .into_iter()
        .map(|i| i.name)
        .collect();
    listed.sort();
    let expected: Vec<String> = model.keys().cloned().collect();
    assert_eq!(listed, expected);
    for (name, content) in model {
        assert!(t.fs.exists(name).expect("exists"));
        assert_eq!(&t.read_all(name), content, "content mismatch for {name}");
    }
}

#[test]
fn fresh_format_is_empty() {
    let t = TestFs::formatted(big_geo());
    let mut ls = t.fs.ls();
    assert_eq!(ls.next_name().expect("ls"), None);
}

#[test]
fn lifecycle_model_workload() {
    let t = TestFs::formatted(big_geo());
    let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

    // Phase 1: creates of assorted sizes, from empty to multi-block.
    for (i, len) in [0_usize, 5, 504, 512, 3000, 9000, 16000].iter().enumerate() {
        let name = format!("file-{i}");
        let data = pattern(i as u64, *len);
        t.write_file(&name, &data);
        model.insert(name, data);
    }
    verify_model(&t, &model);

    // Phase 2: reboot, then append to half of them.
    let t = t.remount();
    verify_model(&t, &model);
    for i in [0_usize, 2, 4, 6] {
        let name = format!("file-{i}");
        let extra = pattern(100 + i as u64, 700);
        let h = t.fs.open_write(&name).expect("reopen");
        assert_eq!(t.fs.write(&h, &extra).expect("append"), extra.len());
        t.fs.close_write(h).expect("close");
        model.get_mut(&name).expect("model entry").extend(extra);
    }
    verify_model(&t, &model);

    // Phase 3: deletions interleaved with new creates.
    for i in [1_usize, 3, 5] {
        let name = format!("file-{i}");
        t.fs.remove(&name).expect("remove");
        model.remove(&name);
    }
    for i in 7..10_usize {
        let name = format!("file-{i}");
        let data = pattern(i as u64, 1234);
        t.write_file(&name, &data);
        model.insert(name, data);
    }
    verify_model(&t, &model);

    // Phase 4: cold reboot again; everything still agrees.
    let t = t.remount();
    verify_model(&t, &model);
}

#[test]
fn delete_reclamation_returns_blocks_to_unallocated() {
    let geo = big_geo();
    let t = TestFs::formatted(geo);
    let initial_free = t.fs.stats().expect("stats").num_free_blocks;

    // A chain several blocks long.
    let data = pattern(42, 20_000);
    t.write_file("t", &data);
    t.fs.remove("t").expect("remove");

    let t = t.remount();
    assert!(!t.fs.exists("t").expect("exists"));
    assert_eq!(t.fs.stats().expect("stats").num_free_blocks, initial_free);

    // Every block except inode0 reads UNALLOCATED again.
    let unallocated = (0..geo.n_blocks())
        .filter(|b| block_is_unallocated(&t.nand, *b))
        .count();
    assert_eq!(unallocated, usize::from(geo.n_blocks()) - 1);
}

#[test]
fn reader_sees_data_committed_before_open() {
    let t = TestFs::formatted(big_geo());
    let first = pattern(9, 600);
    t.write_file("feed", &first);

    // A reader opened now sees the first batch; after the writer
    // appends and closes, the same handle reads on to the new end.
    let h = t.fs.open_read("feed").expect("open_read");
    let mut buf = vec![0_u8; 4096];
    let mut got = Vec::new();
    loop {
        let n = t.fs.read(&h, &mut buf).expect("read");
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, first);

    let second = pattern(10, 800);
    let w = t.fs.open_write("feed").expect("reopen for append");
    assert_eq!(t.fs.write(&w, &second).expect("append"), second.len());
    t.fs.close_write(w).expect("close");

    loop {
        let n = t.fs.read(&h, &mut buf).expect("read");
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    t.fs.close_read(h).expect("close_read");

    let mut expect = first;
    expect.extend_from_slice(&second);
    assert_eq!(got, expect);
}
