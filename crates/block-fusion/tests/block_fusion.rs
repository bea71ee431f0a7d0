//! Integration tests: level-0 fusion through the driver with an in-memory
//! catalog.

mod common;

use block_fusion::{
    BlockSamples, ContainerWriter, FusionDriver, FusionError, JsonSidecar, LocalExecutor,
    NoMetadata, StorageBackend,
};
use common::{box_view, job, BoxCatalogLoader, BoxFusion, BoxView, FailingFusion};
use test_utils::output_container;

fn executor() -> LocalExecutor {
    LocalExecutor::new(Some(4), 1).unwrap()
}

#[test]
fn test_even_cube_writes_every_block() {
    let dir = tempfile::tempdir().unwrap();
    let config = job(&output_container(dir.path()), "block_size: [128, 128, 128]\n");
    let loader = BoxCatalogLoader::new(vec![box_view(0, [0, 0, 0], [255, 255, 255], 7.0)]);
    let executor = executor();

    let summary = FusionDriver::new(&config, &loader, &BoxFusion, &executor)
        .run()
        .unwrap();

    assert_eq!(summary.bounding_box.dimensions(), [256, 256, 256]);
    assert_eq!(summary.stages.len(), 1);
    assert_eq!(summary.stages[0].tasks, 8);
    assert_eq!(summary.stages[0].written, 8);
    assert_eq!(summary.stages[0].skipped, 0);

    // One load for the driver plus one per task; one prefetch per task
    assert_eq!(loader.counters.loads(), 9);
    assert_eq!(loader.counters.prefetched(), 8);

    let writer = ContainerWriter::open(&summary.datasets[0]).unwrap();
    for offset in [[0, 0, 0], [127, 128, 0], [255, 255, 255]] {
        let sample = writer.read_region(offset, [1, 1, 1]).unwrap();
        assert_eq!(sample, BlockSamples::Float32(vec![7.0]), "voxel {:?}", offset);
    }
}

#[test]
fn test_block_outside_every_view_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = job(
        &output_container(dir.path()),
        "block_size: [128, 128, 128]\nbounding_box: roi\n",
    );
    let loader = BoxCatalogLoader::new(vec![box_view(0, [0, 0, 0], [127, 127, 127], 3.0)])
        .with_bounding_box("roi", [0, 0, 0], [255, 127, 127]);
    let executor = executor();

    let summary = FusionDriver::new(&config, &loader, &BoxFusion, &executor)
        .run()
        .unwrap();

    assert_eq!(summary.stages[0].written, 1);
    assert_eq!(summary.stages[0].skipped, 1);

    let writer = ContainerWriter::open(&summary.datasets[0]).unwrap();
    let fused = writer.read_region([120, 0, 0], [16, 1, 1]).unwrap();
    let mut expected = vec![3.0f32; 8];
    expected.extend([0.0f32; 8]);
    assert_eq!(fused, BlockSamples::Float32(expected));
}

#[test]
fn test_overlapping_views_are_averaged_and_offset_applied() {
    let dir = tempfile::tempdir().unwrap();
    let config = job(&output_container(dir.path()), "block_size: [16, 16, 16]\n");
    let loader = BoxCatalogLoader::new(vec![
        box_view(0, [-10, 0, 0], [19, 9, 9], 100.0),
        box_view(1, [10, 0, 0], [39, 9, 9], 300.0),
    ]);
    let executor = executor();

    let summary = FusionDriver::new(&config, &loader, &BoxFusion, &executor)
        .with_metadata(NoMetadata)
        .run()
        .unwrap();

    assert_eq!(summary.bounding_box.min(), [-10, 0, 0]);
    assert_eq!(summary.bounding_box.dimensions(), [50, 10, 10]);
    assert!(!JsonSidecar::path_for_container(&config.container).exists());

    let writer = ContainerWriter::open(&summary.datasets[0]).unwrap();
    assert_eq!(writer.attributes()["offset"], serde_json::json!([-10, 0, 0]));

    // Global x = 9, 10, 19, 20 -> local 19, 20, 29, 30
    let row = writer.read_region([19, 5, 5], [12, 1, 1]).unwrap();
    let mut expected = vec![100.0f32];
    expected.extend([200.0f32; 10]);
    expected.push(300.0);
    assert_eq!(row, BlockSamples::Float32(expected));
}

#[test]
fn test_shared_writer_backend() {
    let dir = tempfile::tempdir().unwrap();
    let config = job(
        &output_container(dir.path()),
        "backend: zarr_sharded\nblock_size: [16, 16, 8]\ndata_type: uint16\nmin_intensity: 0\nmax_intensity: 65535\n",
    );
    let loader = BoxCatalogLoader::new(vec![
        box_view(0, [0, 0, 0], [63, 63, 31], 10.0),
        box_view(1, [32, 0, 0], [63, 63, 31], 30.0),
    ]);
    let executor = executor();

    let driver = FusionDriver::new(&config, &loader, &BoxFusion, &executor);
    let summary = driver.run().unwrap();
    assert_eq!(summary.stages[0].written, 4 * 4 * 4);
    assert_eq!(driver.registry().open_singletons(), 0);

    let spec = &summary.datasets[0];
    assert_eq!(spec.backend, StorageBackend::ZarrSharded);
    let writer = ContainerWriter::open(spec).unwrap();
    let row = writer.read_region([30, 40, 20], [4, 1, 1]).unwrap();
    assert_eq!(row, BlockSamples::UInt16(vec![10, 10, 20, 20]));
}

/// Fuse a volume that is not a multiple of the block size with several
/// native chunks per task, then compare every voxel.
fn fuse_multi_chunk_tasks(backend: &str) {
    let dir = tempfile::tempdir().unwrap();
    let config = job(
        &output_container(dir.path()),
        &format!(
            "backend: {}
block_size: [8, 8, 8]
blocks_per_job: [2, 2, 2]
",
            backend
        ),
    );
    let views = vec![
        box_view(0, [-3, 0, 0], [46, 39, 39], 10.0),
        box_view(1, [20, 10, 5], [46, 39, 39], 30.0),
        box_view(2, [-3, 25, 30], [10, 39, 39], 50.0),
    ];
    let loader = BoxCatalogLoader::new(views.clone());
    let executor = executor();

    let summary = FusionDriver::new(&config, &loader, &BoxFusion, &executor)
        .run()
        .unwrap();

    // [50, 40, 40] with 8 -> 7 x 5 x 5 chunks -> 4 x 3 x 3 tasks
    assert_eq!(summary.bounding_box.min(), [-3, 0, 0]);
    assert_eq!(summary.bounding_box.dimensions(), [50, 40, 40]);
    assert_eq!(summary.stages[0].tasks, 36);
    assert_eq!(summary.blocks_written(), 36);

    let spec = &summary.datasets[0];
    let writer = ContainerWriter::open(spec).unwrap();
    let fused = match writer.read_region([0, 0, 0], spec.dimensions).unwrap() {
        BlockSamples::Float32(v) => v,
        other => panic!("unexpected samples {:?}", other.data_type()),
    };

    let expected = |p: [i64; 3]| {
        let (sum, count) = views
            .iter()
            .filter(|v: &&BoxView| v.bounds.contains(p))
            .fold((0.0f32, 0u32), |(s, c), v| (s + v.value, c + 1));
        sum / count as f32
    };
    let mut index = 0;
    for z in 0..40i64 {
        for y in 0..40i64 {
            for x in -3..47i64 {
                assert_eq!(fused[index], expected([x, y, z]), "voxel ({}, {}, {})", x, y, z);
                index += 1;
            }
        }
    }
    assert_eq!(index, fused.len());
}

#[test]
fn test_multi_chunk_tasks_per_chunk_backend() {
    fuse_multi_chunk_tasks("zarr");
}

#[test]
fn test_multi_chunk_tasks_shared_writer_backend() {
    fuse_multi_chunk_tasks("zarr_sharded");
}

#[test]
fn test_sidecar_written_before_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let container = output_container(dir.path());
    let config = job(&container, "block_size: [8, 8, 8]\n");
    let loader = BoxCatalogLoader::new(vec![box_view(0, [0, 0, 0], [15, 15, 15], 1.0)]);
    let executor = executor();

    let err = FusionDriver::new(&config, &loader, &FailingFusion, &executor)
        .run()
        .unwrap_err();
    match err {
        FusionError::TaskCompute { stage, .. } => assert_eq!(stage, "fusion"),
        other => panic!("unexpected error {:?}", other),
    }

    // Metadata and datasets exist even though every block failed
    let text = std::fs::read_to_string(JsonSidecar::path_for_container(&container)).unwrap();
    let record: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(record["datasets"][0]["path"], "/fused/s0");
}

#[test]
fn test_invalid_configuration_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let container = output_container(dir.path());
    let config = job(&container, "data_type: uint8\n");
    let loader = BoxCatalogLoader::new(vec![box_view(0, [0, 0, 0], [15, 15, 15], 1.0)]);
    let executor = executor();

    let err = FusionDriver::new(&config, &loader, &BoxFusion, &executor)
        .run()
        .unwrap_err();
    assert!(matches!(err, FusionError::Configuration(_)));
    assert!(!container.exists());
    assert_eq!(loader.counters.loads(), 0);
}

#[test]
fn test_unknown_view_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = job(
        &output_container(dir.path()),
        "views: [{ timepoint: 0, setup: 5 }]\n",
    );
    let loader = BoxCatalogLoader::new(vec![box_view(0, [0, 0, 0], [15, 15, 15], 1.0)]);
    let executor = executor();

    let err = FusionDriver::new(&config, &loader, &BoxFusion, &executor)
        .run()
        .unwrap_err();
    assert!(err.is_preflight());
}

#[test]
fn test_anisotropy_transform_applied_per_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = job(
        &output_container(dir.path()),
        "block_size: [32, 32, 32]\npreserve_anisotropy: true\nanisotropy_factor: 2.0\n",
    );
    let loader = BoxCatalogLoader::new(vec![
        box_view(0, [0, 0, 0], [31, 31, 63], 1.0),
        box_view(1, [0, 0, 0], [31, 31, 63], 1.0),
    ]);
    let executor = executor();

    let summary = FusionDriver::new(&config, &loader, &BoxFusion, &executor)
        .run()
        .unwrap();

    assert_eq!(summary.anisotropy_factor, Some(2.0));
    assert_eq!(summary.bounding_box.min(), [0, 0, 0]);
    assert_eq!(summary.bounding_box.max(), [31, 31, 32]);
    // z 0..=32 with block 32 -> two tasks, each adjusting both views
    assert_eq!(summary.stages[0].tasks, 2);
    assert_eq!(loader.counters.transforms(), 4);
}
