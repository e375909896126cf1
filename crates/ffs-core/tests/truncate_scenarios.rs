//! Truncation, concurrent writers and an on-disk image, end to end.

use ffs_core::{Cred, Ffs, FileByteDevice, FormatOptions, IFREG, Inode, MemByteDevice, MountOptions};
use proptest::prelude::*;

fn small_format() -> FormatOptions {
    FormatOptions {
        bsize: 4096,
        fsize: 1024,
        frags_per_group: 2048,
        inodes_per_group: 256,
        ..FormatOptions::default()
    }
}

const DEV_LEN: u64 = 4 * 2048 * 1024;

fn mount() -> Ffs {
    let dev = MemByteDevice::new(usize::try_from(DEV_LEN).unwrap());
    Ffs::format(Box::new(dev), &small_format(), MountOptions::default()).unwrap()
}

fn new_file(fs: &Ffs) -> Inode {
    let root = fs.root().unwrap();
    fs.create(&root, IFREG | 0o644, Cred::ROOT).unwrap()
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 253) as u8)).collect()
}

#[test]
fn truncate_to_current_size_changes_nothing() {
    let fs = mount();
    let mut ip = new_file(&fs);
    fs.write(&mut ip, 0, &pattern(20_000, 1), Cred::ROOT).unwrap();
    let (size, blocks) = (ip.size, ip.blocks);
    let free = fs.stats().cstotal;

    fs.truncate(&mut ip, size, Cred::ROOT).unwrap();
    assert_eq!(ip.size, size);
    assert_eq!(ip.blocks, blocks);
    assert_eq!(fs.stats().cstotal, free);
}

#[test]
fn truncate_to_zero_releases_everything_and_rewrite_matches() {
    let fs = mount();
    let free = fs.stats().cstotal;
    let mut ip = new_file(&fs);
    let data = pattern(30 * 4096 + 700, 9);
    fs.write(&mut ip, 0, &data, Cred::ROOT).unwrap();
    let blocks = ip.blocks;

    fs.truncate(&mut ip, 0, Cred::ROOT).unwrap();
    assert_eq!(ip.size, 0);
    assert_eq!(ip.blocks, 0);
    assert!(ip.db.iter().all(|a| a.is_hole()));
    assert!(ip.ib.iter().all(|a| a.is_hole()));
    // The inode itself is still allocated.
    let now = fs.stats().cstotal;
    assert_eq!(now.nbfree * 4 + now.nffree, free.nbfree * 4 + free.nffree);

    fs.write(&mut ip, 0, &data, Cred::ROOT).unwrap();
    assert_eq!(ip.blocks, blocks);
    assert_eq!(fs.read(&ip, 0, data.len()).unwrap(), data);
    assert!(fs.check().unwrap().is_clean());
}

#[test]
fn truncate_inside_the_double_indirect_range() {
    let fs = mount();
    let mut ip = new_file(&fs);
    // Direct, single indirect and two children of the double indirect.
    let lbns = [0_u64, 5, 12, 500, 1036, 1036 + 1024 + 3];
    for lbn in lbns {
        fs.write(&mut ip, lbn * 4096, &pattern(4096, lbn as u8), Cred::ROOT)
            .unwrap();
    }
    assert!(!ip.ib[1].is_hole());

    // Keep the first child of the double indirect, drop the second.
    fs.truncate(&mut ip, 1040 * 4096, Cred::ROOT).unwrap();
    assert!(!ip.ib[1].is_hole());
    assert!(fs.bmap(&ip, 1036 + 1024 + 3).unwrap().is_hole());
    assert_eq!(
        fs.read(&ip, 1036 * 4096, 4096).unwrap(),
        pattern(4096, 1036_u64 as u8)
    );
    // Data, single indirect, double root and one child.
    assert_eq!(ip.blocks, (5 + 1 + 1 + 1) * 8);
    assert!(fs.check().unwrap().is_clean());

    // Back below the double indirect entirely.
    fs.truncate(&mut ip, 600 * 4096, Cred::ROOT).unwrap();
    assert!(ip.ib[1].is_hole());
    assert_eq!(ip.blocks, (4 + 1) * 8);
    assert_eq!(fs.read(&ip, 500 * 4096, 4096).unwrap(), pattern(4096, 500_u64 as u8));
    assert!(fs.check().unwrap().is_clean());
}

#[test]
fn shrinking_into_a_block_leaves_a_fragment_tail() {
    let fs = mount();
    let mut ip = new_file(&fs);
    fs.write(&mut ip, 0, &pattern(3 * 4096, 4), Cred::ROOT).unwrap();
    fs.truncate(&mut ip, 4096 + 1500, Cred::ROOT).unwrap();
    // One full block plus two fragments.
    assert_eq!(ip.blocks, 8 + 4);
    assert!(ip.db[2].is_hole());

    // Growing past the old tail reads zeroes where the data was cut.
    fs.truncate(&mut ip, 3 * 4096, Cred::ROOT).unwrap();
    let got = fs.read(&ip, 0, 3 * 4096).unwrap();
    assert_eq!(&got[..4096 + 1500], &pattern(3 * 4096, 4)[..4096 + 1500]);
    assert!(got[4096 + 1500..].iter().all(|b| *b == 0));
    assert!(fs.check().unwrap().is_clean());
}

#[test]
fn growing_allocates_only_the_last_block() {
    let fs = mount();
    let mut ip = new_file(&fs);
    let free = fs.stats().cstotal.nbfree;
    let length = 40 * 4096 + 1;

    fs.truncate(&mut ip, length, Cred::ROOT).unwrap();
    assert_eq!(ip.size, length);
    // The block holding the last byte and the indirect block above it.
    assert_eq!(ip.blocks, 16);
    assert_eq!(fs.stats().cstotal.nbfree, free - 2);
    assert!(ip.db.iter().all(|a| a.is_hole()));
    assert!(!ip.ib[0].is_hole());
    assert!(fs.bmap(&ip, 20).unwrap().is_hole());
    assert!(!fs.bmap(&ip, 40).unwrap().is_hole());
    assert_eq!(fs.read(&ip, 0, 4096).unwrap(), vec![0_u8; 4096]);
    assert_eq!(fs.read(&ip, 40 * 4096, 1).unwrap(), vec![0_u8]);
    assert!(fs.check().unwrap().is_clean());
}

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u64, len: usize, seed: u8 },
    Truncate(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0_u64..120_000, 1_usize..6000, any::<u8>())
            .prop_map(|(offset, len, seed)| Op::Write { offset, len, seed }),
        1 => (0_u64..120_000).prop_map(Op::Truncate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn file_contents_follow_a_byte_vector_model(ops in proptest::collection::vec(op(), 1..24)) {
        let fs = mount();
        let mut ip = new_file(&fs);
        let mut model: Vec<u8> = Vec::new();
        for op in ops {
            match op {
                Op::Write { offset, len, seed } => {
                    let data = pattern(len, seed);
                    fs.write(&mut ip, offset, &data, Cred::ROOT).unwrap();
                    let start = offset as usize;
                    if model.len() < start + len {
                        model.resize(start + len, 0);
                    }
                    model[start..start + len].copy_from_slice(&data);
                }
                Op::Truncate(len) => {
                    fs.truncate(&mut ip, len, Cred::ROOT).unwrap();
                    model.resize(len as usize, 0);
                }
            }
            prop_assert_eq!(ip.size, model.len() as u64);
        }
        prop_assert_eq!(fs.read(&ip, 0, model.len()).unwrap(), model);
        let report = fs.check().unwrap();
        prop_assert!(report.is_clean(), "{:?}", report);
    }
}

#[test]
fn concurrent_writers_on_separate_files() {
    let fs = mount();
    let files: Vec<Inode> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4_u8)
            .map(|t| {
                let fs = &fs;
                s.spawn(move || {
                    let mut made = Vec::new();
                    for k in 0..3_u8 {
                        let mut ip = new_file(fs);
                        let seed = t * 16 + k;
                        fs.write(&mut ip, 0, &pattern(20 * 4096 + 100, seed), Cred::ROOT)
                            .unwrap();
                        made.push((ip, seed));
                    }
                    made
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .map(|(ip, seed)| {
                assert_eq!(
                    fs.read(&ip, 0, 20 * 4096 + 100).unwrap(),
                    pattern(20 * 4096 + 100, seed)
                );
                ip
            })
            .collect()
    });
    assert_eq!(files.len(), 12);
    let report = fs.check().unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.inodes_in_use, 13);
}

#[test]
fn image_file_survives_unmount_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ffs.img");
    let dev = FileByteDevice::create(&path, DEV_LEN).unwrap();
    let fs = Ffs::format(Box::new(dev), &small_format(), MountOptions::default()).unwrap();
    let mut ip = new_file(&fs);
    let data = pattern(15 * 4096 + 10, 42);
    fs.write(&mut ip, 0, &data, Cred::ROOT).unwrap();
    let ino = ip.number;
    fs.unmount().unwrap();

    let fs = Ffs::open(&path, MountOptions::default()).unwrap();
    let ip = fs.load_inode(ino).unwrap();
    assert_eq!(ip.size, data.len() as u64);
    assert_eq!(fs.read(&ip, 0, data.len()).unwrap(), data);
    assert!(fs.check().unwrap().is_clean());

    let json = serde_json::to_value(fs.stats()).unwrap();
    assert_eq!(json["ncg"], 4);
    assert_eq!(json["bsize"], 4096);
}
