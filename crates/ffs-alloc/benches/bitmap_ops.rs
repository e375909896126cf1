//! Benchmark: fragment-map search and per-group allocate/free cycles.
//!
//! The group is pre-fragmented so `mapsearch` has to walk most of the map
//! before it finds a run of the requested length.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ffs_alloc::bitmap::set_block;
use ffs_alloc::{CgOps, rebuild_summaries};
use ffs_ondisk::{AddrWidth, CsSum, CylinderGroup, FragsPerBlock, Optim, Superblock};
use ffs_types::DiskAddr;

fn geometry(frags: FragsPerBlock) -> Superblock {
    let frag = frags.count();
    Superblock {
        bsize: 1024 * frag,
        fsize: 1024,
        frags,
        fpg: 32_768,
        ipg: 2048,
        ncg: 1,
        inode_size: 128,
        size: 32_768,
        dsize: 32_000,
        sblkno: 64,
        cblkno: 72,
        iblkno: 80,
        dblkno: 336,
        cgsize: 8192,
        cssize: 1024,
        csaddr: DiskAddr(336),
        ndaddr: 12,
        addr_width: AddrWidth::U32,
        nsect: 64,
        ntrak: 16,
        nrpos: 8,
        cpg: 64,
        rps: 60,
        rotdelay: 0,
        contigsumsize: 16,
        maxcontig: 16,
        maxbpg: 2048,
        minfree: 8,
        optim: Optim::Time,
        avgfilesize: 16_384,
        avgfpdir: 64,
        cgrotor: 0,
        cstotal: CsSum::default(),
        time: 0,
        clean: true,
        flags: 0,
    }
}

/// Every block free except one fragment in each, plus a fully free tail.
fn fragmented_group(sb: &Superblock) -> CylinderGroup {
    let mut cg = CylinderGroup::empty(sb, 0);
    let frag = sb.frag();
    let first = sb.dblkno / frag;
    let last = sb.blocks_per_group();
    for blkno in first..last {
        set_block(&mut cg.blksfree, sb.frags, blkno);
        if blkno < last - 64 && frag > 1 {
            let bit = blkno * frag;
            cg.blksfree[(bit / 8) as usize] &= !(1 << (bit % 8));
        }
    }
    rebuild_summaries(sb, &mut cg);
    cg
}

fn bench_mapsearch(c: &mut Criterion) {
    let mut group = c.benchmark_group("mapsearch");
    for frags in [FragsPerBlock::Four, FragsPerBlock::Eight] {
        let sb = geometry(frags);
        let cg = fragmented_group(&sb);
        let want = sb.frag();
        group.bench_function(format!("full_block_frag{}", sb.frag()), |b| {
            b.iter_batched(
                || CgOps::new(&sb, cg.clone()),
                |mut ops| black_box(ops.mapsearch(Some(0), want)),
                criterion::BatchSize::SmallInput,
            );
        });
        group.bench_function(format!("run_of_2_frag{}", sb.frag()), |b| {
            b.iter_batched(
                || CgOps::new(&sb, cg.clone()),
                |mut ops| black_box(ops.mapsearch(Some(0), 2)),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sb = geometry(FragsPerBlock::Eight);
    let cg = fragmented_group(&sb);
    c.bench_function("alloc_free_fragment_cycle", |b| {
        b.iter_batched(
            || CgOps::new(&sb, cg.clone()),
            |mut ops| {
                for size in [1024_u32, 3072, 2048, 8192] {
                    if let Ok(Some(bno)) = ops.alloc_frag(0, size) {
                        let _ = ops.free_blocks(bno, size);
                    }
                }
                black_box(ops.delta())
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_rebuild(c: &mut Criterion) {
    let sb = geometry(FragsPerBlock::Eight);
    let cg = fragmented_group(&sb);
    c.bench_function("rebuild_summaries_32k_frags", |b| {
        b.iter_batched(
            || cg.clone(),
            |mut cg| {
                rebuild_summaries(&sb, &mut cg);
                black_box(cg.cs)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_mapsearch, bench_alloc_free_cycle, bench_rebuild);
criterion_main!(benches);
