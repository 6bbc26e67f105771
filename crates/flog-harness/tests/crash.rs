//! Power-loss sweeps: cut power at every durable-event boundary inside
//! an operation and check that the next mount lands in a consistent
//! state — the committed prefix of the interrupted write, or the pre-
//! or post-state of an interrupted deletion. Never an error, never a
//! corrupt namespace.

use flog_core::{Flogfs, Geometry};
use flog_harness::{durable_events, pattern, TestFs};

fn geo() -> Geometry {
    Geometry::new(512, 4, 2, 16).expect("geometry")
}

fn seeded_media() -> (TestFs, Vec<u8>, Vec<u8>) {
    let t = TestFs::formatted(geo());
    let seed = pattern(1, 900);
    let bystander = pattern(2, 700);
    t.write_file("log", &seed);
    t.write_file("other", &bystander);
    (t, seed, bystander)
}

/// Append enough to force a tail-sector handoff into a second block.
fn append_op(fs: &Flogfs, data: &[u8]) -> flog_core::Result<()> {
    let h = fs.open_write("log")?;
    fs.write(&h, data)?;
    fs.close_write(h)
}

#[test]
fn crash_sweep_during_cross_block_append() {
    let appended = pattern(3, 4000);

    // Baseline: count the durable events the append needs.
    let (t, seed, bystander) = seeded_media();
    let before = durable_events(&t.nand);
    append_op(&t.fs, &appended).expect("baseline append");
    let total = durable_events(&t.nand) - before;
    assert!(total > 4, "the append must span several commits");

    for budget in 0..=total {
        let (t, _, _) = seeded_media();
        let nand = t.nand.clone();

        nand.power_cut_after(budget);
        // The append may fail part-way through; that is the point.
        let _ = append_op(&t.fs, &appended);
        drop(t);
        nand.power_restore();

        let t = TestFs::mounted_over(geo(), nand);

        // The interrupted file reads back as seed plus a prefix of the
        // appended bytes.
        let got = t.read_all("log");
        assert!(
            got.len() >= seed.len(),
            "budget {budget}: committed seed data vanished"
        );
        assert_eq!(&got[..seed.len()], &seed[..], "budget {budget}");
        let tail = &got[seed.len()..];
        assert!(
            tail.len() <= appended.len() && tail == &appended[..tail.len()],
            "budget {budget}: tail is not a prefix of the appended bytes"
        );

        // Bystanders are untouched and the filesystem still works.
        assert_eq!(t.read_all("other"), bystander, "budget {budget}");
        let name = format!("post-{budget}");
        t.write_file(&name, b"recovered");
        assert_eq!(t.read_all(&name), b"recovered");

        // A further remount is stable.
        let stats_a = t.fs.stats().expect("stats");
        let t = t.remount();
        let stats_b = t.fs.stats().expect("stats");
        assert_eq!(stats_a.num_free_blocks, stats_b.num_free_blocks, "budget {budget}");
        assert_eq!(stats_a.max_file_id, stats_b.max_file_id, "budget {budget}");
    }
}

#[test]
fn crash_sweep_during_create() {
    // One entry pair per inode block on this geometry, so creating a
    // second file forces an inode-chain extension: tail commit, erase,
    // init stamp, entry commit, then the first data sectors.
    let payload = pattern(5, 1200);

    let setup = || {
        let t = TestFs::formatted(geo());
        t.write_file("first", b"anchor entry");
        t
    };

    let create_op = |fs: &Flogfs| -> flog_core::Result<()> {
        let h = fs.open_write("second")?;
        fs.write(&h, &payload)?;
        fs.close_write(h)
    };

    let t = setup();
    let before = durable_events(&t.nand);
    create_op(&t.fs).expect("baseline create");
    let total = durable_events(&t.nand) - before;
    assert!(total > 3, "the create must span several durable events");

    for budget in 0..=total {
        let t = setup();
        let nand = t.nand.clone();

        nand.power_cut_after(budget);
        let _ = create_op(&t.fs);
        drop(t);
        nand.power_restore();

        let t = TestFs::mounted_over(geo(), nand);

        assert_eq!(t.read_all("first"), b"anchor entry", "budget {budget}");
        if t.fs.exists("second").expect("exists") {
            let got = t.read_all("second");
            assert!(
                got.len() <= payload.len() && got == payload[..got.len()],
                "budget {budget}: partial create is not a prefix"
            );
        }

        // Creating another file exercises the (possibly recovered)
        // inode chain end to end.
        let name = format!("post-{budget}");
        t.write_file(&name, b"onward");
        assert_eq!(t.read_all(&name), b"onward");
    }
}

#[test]
fn crash_sweep_during_remove() {
    let victim_data = pattern(4, 5000); // spans two blocks

    let setup = || {
        let t = TestFs::formatted(geo());
        t.write_file("victim", &victim_data);
        t.write_file("other", b"bystander");
        t
    };

    // Baseline event count for the removal.
    let t = setup();
    let before = durable_events(&t.nand);
    t.fs.remove("victim").expect("baseline remove");
    let total = durable_events(&t.nand) - before;
    assert!(total >= 3, "remove must invalidate and reclaim");

    for budget in 0..=total {
        let t = setup();
        let nand = t.nand.clone();

        nand.power_cut_after(budget);
        let _ = t.fs.remove("victim");
        drop(t);
        nand.power_restore();

        let t = TestFs::mounted_over(geo(), nand);

        // Either the deletion never became visible (entry still live,
        // data intact) or it is complete as far as the namespace is
        // concerned.
        if t.fs.exists("victim").expect("exists") {
            assert_eq!(t.read_all("victim"), victim_data, "budget {budget}");
            t.fs.remove("victim").expect("redo remove");
            assert!(!t.fs.exists("victim").expect("exists"));
        }
        assert_eq!(t.read_all("other"), b"bystander", "budget {budget}");

        // The filesystem keeps working after recovery.
        let name = format!("post-{budget}");
        t.write_file(&name, b"alive");
        assert_eq!(t.read_all(&name), b"alive");

        let t = t.remount();
        assert!(t.fs.exists(&name).expect("exists"));
    }
}
